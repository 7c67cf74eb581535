use std::time::Duration;

use crate::ProcJobError;

/// Settings for the [`crate::runner::JobRunner`].
///
/// By default jobs have no time limit and run until they exit or are cancelled.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunnerConfig {
    timeout: Option<Duration>,
}

impl RunnerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Kill jobs still running after `timeout` and record them as failed.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn validate(&self) -> Result<(), ProcJobError> {
        if self.timeout.is_some_and(|timeout| timeout.is_zero()) {
            return Err(ProcJobError::InvalidConfig(
                "timeout must be greater than 0".to_owned(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn default_has_no_timeout() {
        let config = RunnerConfig::default();
        assert_eq!(config.timeout(), None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let config = RunnerConfig::new().with_timeout(Duration::ZERO);
        assert_matches!(config.validate(), Err(ProcJobError::InvalidConfig(_)));

        let config = RunnerConfig::new().with_timeout(Duration::from_secs(30));
        assert_eq!(config.timeout(), Some(Duration::from_secs(30)));
        assert!(config.validate().is_ok());
    }
}
