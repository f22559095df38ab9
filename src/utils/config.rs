//! Configuration parameters struct parsing helper.

/// Composes a configuration struct from its default values, then overwrites
/// the listed fields with values parsed from the given TOML string, if any.
/// Returns `Ok(config)` on success and `Err(RendezvousError)` on a parse
/// failure or on any key that is not one of the listed fields.
///
/// Example:
/// ```ignore
/// let config = parsed_config!(config_str => WorkerConfig;
///                             heartbeat_interval_ms, reply_timeout_ms)?;
/// ```
#[macro_export]
macro_rules! parsed_config {
    ($config_str:expr => $config_type:ty; $($field:ident),+) => {{
        let config_str: Option<&str> = $config_str;

        let compose_config = || -> Result<$config_type, $crate::RendezvousError> {
            let mut config: $config_type = Default::default();
            let config_str = match config_str {
                Some(s) => s,
                None => return Ok(config),
            };

            let mut table = config_str.parse::<toml::Table>()?;

            $({
                if let Some(v) = table.remove(stringify!($field)) {
                    config.$field = v.try_into()?;
                }
            })+

            // whatever is left over was not expected
            if let Some(key) = table.keys().next() {
                return Err($crate::RendezvousError::msg(format!(
                    "invalid field name '{}' in config",
                    key,
                )));
            }

            Ok(config)
        };

        compose_config()
    }};
}

#[cfg(test)]
mod config_tests {
    use crate::utils::RendezvousError;

    #[derive(Debug, PartialEq)]
    struct TestConfig {
        interval_ms: u64,
        group: String,
        enabled: bool,
    }

    impl Default for TestConfig {
        fn default() -> Self {
            TestConfig {
                interval_ms: 5000,
                group: "".into(),
                enabled: false,
            }
        }
    }

    #[test]
    fn parse_from_none() -> Result<(), RendezvousError> {
        let config =
            parsed_config!(None => TestConfig; interval_ms, group, enabled)?;
        assert_eq!(config, TestConfig::default());
        Ok(())
    }

    #[test]
    fn parse_from_partial() -> Result<(), RendezvousError> {
        let config_str = Some("group = '230.30.30.30:3030'\nenabled = true");
        let config =
            parsed_config!(config_str => TestConfig; group, enabled)?;
        let ref_config = TestConfig {
            interval_ms: 5000,
            group: "230.30.30.30:3030".into(),
            enabled: true,
        };
        assert_eq!(config, ref_config);
        Ok(())
    }

    #[test]
    fn parse_invalid_field() {
        let config_str = Some("bogus = 999");
        assert!(parsed_config!(config_str => TestConfig; interval_ms).is_err());
    }

    #[test]
    fn parse_wrong_value_type() {
        let config_str = Some("interval_ms = 'soon'");
        assert!(parsed_config!(config_str => TestConfig; interval_ms).is_err());
    }
}
