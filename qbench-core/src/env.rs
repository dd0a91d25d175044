//! convenience fns for parsing env vars
use anyhow::Context;

use std::{env, str};

/// Returns the value of the environment variable `name` parsed as `T`, or
/// `default` parsed as `T` if it isn't set
pub fn parse_var<T, S>(name: &str, default: S) -> Result<T, <T as str::FromStr>::Err>
where
    T: str::FromStr,
    S: ToString,
{
    env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .parse::<T>()
}

/// Calls [`parse_var`] but names the variable in the error
///
/// [`parse_var`]: crate::env::parse_var
pub fn parse_var_with_err<T, S>(name: &str, default: S) -> anyhow::Result<T>
where
    T: str::FromStr,
    <T as str::FromStr>::Err: std::error::Error + Send + Sync + 'static,
    S: ToString + Send,
{
    parse_var::<T, S>(name, default).with_context(|| format!("error parsing env var {name}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn falls_back_to_default() {
        let val: u64 = parse_var("QBENCH_TEST_UNSET_VAR", 42).unwrap();
        assert_eq!(val, 42);
    }

    #[test]
    fn bad_value_names_the_var() {
        let err = parse_var_with_err::<u64, _>("QBENCH_TEST_UNSET_VAR_2", "nope").unwrap_err();
        assert!(err.to_string().contains("QBENCH_TEST_UNSET_VAR_2"));
    }
}
