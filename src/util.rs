//! Small path helpers shared by the configuration and shell layers.

/// Expands a leading `~/` to the current user's home directory.
///
/// Paths without the prefix, and environments with no `HOME` set, pass
/// through unchanged; SSH and the document stores treat the result as an
/// ordinary path either way.
///
/// # Examples
///
/// ```
/// # use machina::util::expand_tilde;
/// let home = std::env::var("HOME").expect("HOME should be set");
/// assert_eq!(expand_tilde("~/.ssh/id_ed25519"), format!("{home}/.ssh/id_ed25519"));
/// assert_eq!(expand_tilde("/absolute/path"), "/absolute/path");
/// ```
#[must_use]
pub fn expand_tilde(path: &str) -> String {
    match (path.strip_prefix("~/"), std::env::var_os("HOME")) {
        (Some(rest), Some(home)) => format!("{}/{rest}", home.to_string_lossy()),
        _ => path.to_owned(),
    }
}
