//! EC2 implementation of the [`CloudProvider`] interface.
//!
//! Launch parameters map one-to-one onto `RunInstances`: block-device
//! mappings use the general-purpose SSD volume type and are deleted on
//! termination, and the IAM instance profile attaches by ARN or by name as
//! the request dictates. Readiness relies on the SDK's `InstanceRunning`
//! waiter, which owns long-poll retry and backoff.

use std::time::Duration;

use aws_sdk_ec2::Client;
use aws_sdk_ec2::client::Waiters;
use aws_sdk_ec2::error::DisplayErrorContext;
use aws_sdk_ec2::types::{
    BlockDeviceMapping, EbsBlockDevice, IamInstanceProfileSpecification, InstanceType,
    Tag as Ec2Tag, VolumeType,
};
use thiserror::Error;

use crate::launch::{IamRoleRef, LaunchRequest, Tag};
use crate::provider::{CloudProvider, InstanceDescription, ProviderFuture};

const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(600);

/// Errors raised by the EC2 provider.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum Ec2Error {
    /// Raised when the requested instance type cannot be parsed.
    #[error("invalid instance type: {instance_type}")]
    InvalidInstanceType {
        /// Requested instance type string.
        instance_type: String,
    },
    /// Raised when an API call fails.
    #[error("{operation} failed: {message}")]
    Api {
        /// API operation that failed.
        operation: &'static str,
        /// Message rendered from the SDK error chain.
        message: String,
    },
    /// Raised when a describe finds no instance for the identifier.
    #[error("instance {instance_id} not found")]
    InstanceNotFound {
        /// Identifier that was looked up.
        instance_id: String,
    },
    /// Raised when the running-state waiter gives up.
    #[error("wait for instance {instance_id} to run failed: {message}")]
    Wait {
        /// Identifier being waited on.
        instance_id: String,
        /// Message rendered from the waiter error.
        message: String,
    },
    /// Raised when image registration succeeds without returning an id.
    #[error("image registration for {instance_id} returned no image id")]
    MissingImageId {
        /// Source instance identifier.
        instance_id: String,
    },
}

fn api_error<E>(operation: &'static str, err: E) -> Ec2Error
where
    E: std::error::Error,
{
    Ec2Error::Api {
        operation,
        message: DisplayErrorContext(err).to_string(),
    }
}

/// Cloud provider backed by the EC2 API.
#[derive(Clone, Debug)]
pub struct Ec2Provider {
    client: Client,
    wait_timeout: Duration,
}

impl Ec2Provider {
    /// Wraps an existing EC2 client.
    #[must_use]
    pub const fn new(client: Client) -> Self {
        Self {
            client,
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
        }
    }

    /// Builds a provider from the ambient AWS configuration (environment
    /// variables, shared config files, instance metadata), optionally
    /// pinning the region.
    pub async fn from_env(region: Option<String>) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region_name) = region {
            loader = loader.region(aws_config::Region::new(region_name));
        }
        let config = loader.load().await;
        Self::new(Client::new(&config))
    }

    /// Overrides the maximum time the running-state waiter is allowed.
    #[must_use]
    pub const fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }

    async fn submit_launch(&self, request: &LaunchRequest) -> Result<Vec<String>, Ec2Error> {
        let instance_type: InstanceType = request.instance_type.parse().map_err(|_| {
            Ec2Error::InvalidInstanceType {
                instance_type: request.instance_type.clone(),
            }
        })?;

        let mut call = self
            .client
            .run_instances()
            .image_id(&request.image_id)
            .instance_type(instance_type)
            .key_name(&request.key_name)
            .min_count(1)
            .max_count(request.count)
            .subnet_id(&request.subnet_id);

        for device in &request.block_devices {
            call = call.block_device_mappings(
                BlockDeviceMapping::builder()
                    .device_name(&device.device_name)
                    .ebs(
                        EbsBlockDevice::builder()
                            .volume_size(device.size_gib)
                            .volume_type(VolumeType::Gp2)
                            .delete_on_termination(true)
                            .build(),
                    )
                    .build(),
            );
        }

        for group_id in &request.security_group_ids {
            call = call.security_group_ids(group_id);
        }

        match &request.iam_role {
            Some(IamRoleRef::Arn(arn)) => {
                call = call.iam_instance_profile(
                    IamInstanceProfileSpecification::builder().arn(arn).build(),
                );
            }
            Some(IamRoleRef::Name(name)) => {
                call = call.iam_instance_profile(
                    IamInstanceProfileSpecification::builder().name(name).build(),
                );
            }
            None => {}
        }

        let response = call
            .send()
            .await
            .map_err(|err| api_error("RunInstances", err))?;

        Ok(response
            .instances()
            .iter()
            .filter_map(|instance| instance.instance_id().map(ToOwned::to_owned))
            .collect())
    }

    async fn fetch_description(&self, instance_id: &str) -> Result<InstanceDescription, Ec2Error> {
        let response = self
            .client
            .describe_instances()
            .instance_ids(instance_id)
            .send()
            .await
            .map_err(|err| api_error("DescribeInstances", err))?;

        let instance = response
            .reservations()
            .first()
            .and_then(|reservation| reservation.instances().first())
            .ok_or_else(|| Ec2Error::InstanceNotFound {
                instance_id: instance_id.to_owned(),
            })?;

        Ok(InstanceDescription {
            id: instance.instance_id().unwrap_or(instance_id).to_owned(),
            public_address: instance.public_ip_address().map(ToOwned::to_owned),
            private_address: instance.private_ip_address().map(ToOwned::to_owned),
            state: instance
                .state()
                .and_then(|state| state.name())
                .map_or_else(|| String::from("unknown"), |name| name.as_str().to_owned()),
        })
    }
}

impl CloudProvider for Ec2Provider {
    type Error = Ec2Error;

    fn launch<'a>(
        &'a self,
        request: &'a LaunchRequest,
    ) -> ProviderFuture<'a, Vec<String>, Self::Error> {
        Box::pin(self.submit_launch(request))
    }

    fn create_tags<'a>(
        &'a self,
        instance_ids: &'a [String],
        tags: &'a [Tag],
    ) -> ProviderFuture<'a, (), Self::Error> {
        Box::pin(async move {
            let mut call = self.client.create_tags();
            for instance_id in instance_ids {
                call = call.resources(instance_id);
            }
            for tag in tags {
                call = call.tags(Ec2Tag::builder().key(&tag.key).value(&tag.value).build());
            }
            call.send()
                .await
                .map_err(|err| api_error("CreateTags", err))?;
            Ok(())
        })
    }

    fn start_instance<'a>(&'a self, instance_id: &'a str) -> ProviderFuture<'a, (), Self::Error> {
        Box::pin(async move {
            self.client
                .start_instances()
                .instance_ids(instance_id)
                .send()
                .await
                .map_err(|err| api_error("StartInstances", err))?;
            Ok(())
        })
    }

    fn stop_instance<'a>(&'a self, instance_id: &'a str) -> ProviderFuture<'a, (), Self::Error> {
        Box::pin(async move {
            self.client
                .stop_instances()
                .instance_ids(instance_id)
                .send()
                .await
                .map_err(|err| api_error("StopInstances", err))?;
            Ok(())
        })
    }

    fn terminate_instance<'a>(
        &'a self,
        instance_id: &'a str,
    ) -> ProviderFuture<'a, (), Self::Error> {
        Box::pin(async move {
            self.client
                .terminate_instances()
                .instance_ids(instance_id)
                .send()
                .await
                .map_err(|err| api_error("TerminateInstances", err))?;
            Ok(())
        })
    }

    fn reboot_instance<'a>(&'a self, instance_id: &'a str) -> ProviderFuture<'a, (), Self::Error> {
        Box::pin(async move {
            self.client
                .reboot_instances()
                .instance_ids(instance_id)
                .send()
                .await
                .map_err(|err| api_error("RebootInstances", err))?;
            Ok(())
        })
    }

    fn describe_instance<'a>(
        &'a self,
        instance_id: &'a str,
    ) -> ProviderFuture<'a, InstanceDescription, Self::Error> {
        Box::pin(self.fetch_description(instance_id))
    }

    fn wait_until_running<'a>(
        &'a self,
        instance_id: &'a str,
    ) -> ProviderFuture<'a, (), Self::Error> {
        Box::pin(async move {
            self.client
                .wait_until_instance_running()
                .instance_ids(instance_id)
                .wait(self.wait_timeout)
                .await
                .map_err(|err| Ec2Error::Wait {
                    instance_id: instance_id.to_owned(),
                    message: DisplayErrorContext(err).to_string(),
                })?;
            Ok(())
        })
    }

    fn create_image<'a>(
        &'a self,
        instance_id: &'a str,
        name: &'a str,
        description: &'a str,
    ) -> ProviderFuture<'a, String, Self::Error> {
        Box::pin(async move {
            let response = self
                .client
                .create_image()
                .instance_id(instance_id)
                .name(name)
                .description(description)
                .send()
                .await
                .map_err(|err| api_error("CreateImage", err))?;

            response
                .image_id()
                .map(ToOwned::to_owned)
                .ok_or_else(|| Ec2Error::MissingImageId {
                    instance_id: instance_id.to_owned(),
                })
        })
    }
}
