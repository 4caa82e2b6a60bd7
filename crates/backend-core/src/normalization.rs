use tracing::warn;

use crate::error::BackendError;

/// Result of a dual-backend operation whose primary step succeeded.
///
/// `warning` carries a degraded secondary step; the value stays valid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome<T> {
    pub value: T,
    pub warning: Option<BackendError>,
}

impl<T> Outcome<T> {
    pub fn clean(value: T) -> Self {
        Self {
            value,
            warning: None,
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.warning.is_some()
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        Outcome {
            value: f(self.value),
            warning: self.warning,
        }
    }
}

/// Combine a confirmed primary value with a best-effort secondary result.
///
/// A failed secondary step is logged and attached as a `DegradedSync`
/// warning instead of failing the operation.
pub fn normalize_secondary_outcome<T, S>(
    operation: &str,
    value: T,
    secondary: Result<S, BackendError>,
) -> (Outcome<T>, Option<S>) {
    match secondary {
        Ok(extra) => (Outcome::clean(value), Some(extra)),
        Err(err) => {
            let degraded = err.into_degraded(operation);
            warn!(
                operation,
                error = %degraded,
                "secondary protocol step failed; keeping gateway result"
            );
            (
                Outcome {
                    value,
                    warning: Some(degraded),
                },
                None,
            )
        }
    }
}

/// Treat a conflict ("already joined", "already a member") as success.
///
/// `fallback` builds the value reported for the soft success.
pub fn soften_conflict<T>(
    result: Result<T, BackendError>,
    fallback: impl FnOnce(&BackendError) -> T,
) -> Result<T, BackendError> {
    match result {
        Err(err) if err.is_conflict() => Ok(fallback(&err)),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BackendErrorCategory;

    #[test]
    fn successful_secondary_step_is_clean() {
        let (outcome, extra) =
            normalize_secondary_outcome("protocol join", "!a:x", Ok::<_, BackendError>(5_u8));
        assert_eq!(outcome, Outcome::clean("!a:x"));
        assert_eq!(extra, Some(5));
    }

    #[test]
    fn failed_secondary_step_becomes_degraded_warning() {
        let (outcome, extra) = normalize_secondary_outcome::<_, ()>(
            "protocol join",
            "!a:x",
            Err(BackendError::transport("timeout", "slow")),
        );
        assert!(outcome.is_degraded());
        assert_eq!(outcome.value, "!a:x");
        assert_eq!(extra, None);
        let warning = outcome.warning.expect("warning should be attached");
        assert_eq!(warning.category, BackendErrorCategory::DegradedSync);
    }

    #[test]
    fn conflicts_are_soft_successes() {
        let conflict = BackendError::from_http_status(409, "gateway_http_error", "already joined");
        let softened = soften_conflict(Err(conflict), |_| "fallback");
        assert_eq!(softened, Ok("fallback"));

        let auth = BackendError::from_http_status(401, "gateway_http_error", "nope");
        let kept = soften_conflict::<&str>(Err(auth.clone()), |_| "fallback");
        assert_eq!(kept, Err(auth));
    }
}
