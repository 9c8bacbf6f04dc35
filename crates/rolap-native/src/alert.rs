//! The "native evaluation unsupported" side channel.

use crate::config::AlertLevel;
use crate::error::{NativeError, NativeResult};
use dashmap::DashSet;
use std::fmt;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RefusalReason {
    /// The construct's native evaluation is switched off; never alerted.
    FeatureDisabled(&'static str),
    Unsupported(String),
}

/// Why an expression is left to the in-memory evaluator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Refusal {
    /// MDX-like rendering of the refused expression.
    pub expression: String,
    pub reason: RefusalReason,
    /// Stable fingerprint of the refused expression.
    pub fingerprint: u64,
}

impl fmt::Display for Refusal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.reason {
            RefusalReason::FeatureDisabled(flag) => {
                write!(f, "{}: native evaluation disabled by {flag}", self.expression)
            }
            RefusalReason::Unsupported(reason) => write!(f, "{}: {reason}", self.expression),
        }
    }
}

/// Receives one notification per distinct unsupported expression.
pub trait UnsupportedObserver: Send + Sync {
    fn on_unsupported(&self, refusal: &Refusal);
}

impl<F> UnsupportedObserver for F
where
    F: Fn(&Refusal) + Send + Sync,
{
    fn on_unsupported(&self, refusal: &Refusal) {
        self(refusal)
    }
}

/// Applies the configured alert level, once per expression fingerprint.
#[derive(Default)]
pub(crate) struct AlertTracker {
    seen: DashSet<u64>,
}

impl AlertTracker {
    /// Handle a refusal: `Ok(())` to fall back, or the error the evaluation must fail with.
    pub(crate) fn report(
        &self,
        level: AlertLevel,
        refusal: &Refusal,
        observer: Option<&dyn UnsupportedObserver>,
    ) -> NativeResult<()> {
        let reason = match &refusal.reason {
            RefusalReason::FeatureDisabled(_) => {
                log::trace!("{refusal}");
                return Ok(());
            }
            RefusalReason::Unsupported(reason) => reason,
        };
        if level == AlertLevel::Off {
            log::trace!("{refusal}");
            return Ok(());
        }
        if self.seen.insert(refusal.fingerprint) {
            if level == AlertLevel::Warn {
                log::warn!("native evaluation unsupported: {refusal}");
            }
            if let Some(observer) = observer {
                observer.on_unsupported(refusal);
            }
        }
        match level {
            AlertLevel::Error => Err(NativeError::NativeEvaluationUnsupported {
                expression: refusal.expression.clone(),
                reason: reason.clone(),
            }),
            _ => Ok(()),
        }
    }

    pub(crate) fn clear(&self) {
        self.seen.clear();
    }
}
