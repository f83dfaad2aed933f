//! Home directory expansion for configured paths.

use std::env;

/// Replaces a leading `~/` with `$HOME/`. Paths are returned as given when
/// they do not start with `~/` or `HOME` is unset.
///
/// ```
/// # use spotkeep::remote::expand_tilde;
/// let home = std::env::var("HOME").unwrap_or_default();
/// if !home.is_empty() {
///     assert_eq!(expand_tilde("~/specs"), format!("{home}/specs"));
/// }
/// assert_eq!(expand_tilde("/etc/spotkeep"), "/etc/spotkeep");
/// ```
#[must_use]
pub fn expand_tilde(path: &str) -> String {
    path.strip_prefix("~/")
        .zip(env::var_os("HOME"))
        .map_or_else(
            || path.to_owned(),
            |(rest, home)| format!("{}/{rest}", home.to_string_lossy()),
        )
}
