//! Environment variable allow-list for the sandboxed executor.
//!
//! Every command the governor runs (§4.6/§4.7) is spawned with a rebuilt
//! environment rather than the worker's own: only a short allow-list of
//! interactive-shell variables is preserved, and anything that looks like a
//! credential is dropped even if its name happens to match the allow-list's
//! prefix rules below.

/// Env vars copied verbatim from the worker's own environment into every
/// spawned command, if present.
const ALLOWED_SPAWN_ENV: &[&str] = &[
    "PATH",
    "HOME",
    "USER",
    "LANG",
    "LC_ALL",
    "TERM",
    "SHELL",
    "PWD",
    "OLDPWD",
    "SHLVL",
    "HOSTNAME",
    "HOSTTYPE",
    "OSTYPE",
    "MACHTYPE",
    "LOGNAME",
];

/// Prefixes that are dropped even though they are not on the allow-list
/// above (defense in depth: these are the families that commonly carry
/// credentials into a child process's environment).
const BLOCKED_PREFIXES: &[&str] = &["aws_", "ssh_", "git_"];

/// Substrings that mark a variable as credential-shaped and therefore
/// unconditionally dropped, regardless of its name otherwise matching the
/// allow-list.
const BLOCKED_SUBSTRINGS: &[&str] = &["token", "secret", "password", "api_key", "private_key"];

/// Returns `true` if `key` should be copied into a spawned command's
/// environment.
#[must_use]
pub fn is_allowed_spawn_env(key: &str) -> bool {
    let lower = key.to_ascii_lowercase();

    if BLOCKED_PREFIXES.iter().any(|p| lower.starts_with(p)) {
        return false;
    }
    if BLOCKED_SUBSTRINGS.iter().any(|s| lower.contains(s)) {
        return false;
    }

    ALLOWED_SPAWN_ENV.iter().any(|k| k.eq_ignore_ascii_case(key))
}

/// Build the environment map to pass to a spawned child process, given the
/// worker's own environment as `(key, value)` pairs.
#[must_use]
pub fn filter_spawn_env<'a, I>(vars: I) -> Vec<(String, String)>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    vars.into_iter()
        .filter(|(k, _)| is_allowed_spawn_env(k))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}
