//! Permission mediation for risk-sensitive tool invocations.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::proto::wire::{PermissionOption, PermissionOptionKind, PermissionOutcome};

/// How inbound permission requests are answered.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PermissionPolicy {
    /// Auto-select an allow option when one exists; otherwise fall through
    /// to the interactive chooser.
    AllowAll,
    /// Always delegate to the interactive chooser.
    #[default]
    Ask,
}

/// Interactive chooser collaborator invoked when policy does not decide.
///
/// Returns the chosen option id, or `None` when the user dismissed the
/// prompt without selecting.
pub trait PermissionChooser: Send + Sync {
    /// Present `options` for the given tool call and resolve to a selection.
    fn choose(
        &self,
        tool_call: &Value,
        options: &[PermissionOption],
    ) -> Pin<Box<dyn Future<Output = Option<String>> + Send + '_>>;
}

/// Chooser that never selects anything; every delegated request resolves to
/// a cancelled outcome.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullChooser;

impl PermissionChooser for NullChooser {
    fn choose(
        &self,
        _tool_call: &Value,
        _options: &[PermissionOption],
    ) -> Pin<Box<dyn Future<Output = Option<String>> + Send + '_>> {
        Box::pin(async { None })
    }
}

/// Answers inbound `session/request_permission` calls.
pub struct PermissionMediator {
    policy: PermissionPolicy,
    chooser: Arc<dyn PermissionChooser>,
}

impl PermissionMediator {
    /// Create a mediator with the given policy and chooser collaborator.
    #[must_use]
    pub fn new(policy: PermissionPolicy, chooser: Arc<dyn PermissionChooser>) -> Self {
        Self { policy, chooser }
    }

    /// Resolve a permission request to exactly one outcome.
    ///
    /// In allow-all mode an `allow_always` option wins, else `allow_once`;
    /// when neither kind is present the request falls through to the
    /// interactive path. In ask mode the chooser is always consulted, and
    /// no selection means `Cancelled`.
    pub async fn decide(
        &self,
        tool_call: &Value,
        options: &[PermissionOption],
    ) -> PermissionOutcome {
        if self.policy == PermissionPolicy::AllowAll {
            if let Some(option_id) = auto_allow(options) {
                debug!(option_id = %option_id, "permission auto-selected by policy");
                return PermissionOutcome::Selected { option_id };
            }
        }

        match self.chooser.choose(tool_call, options).await {
            Some(option_id) => PermissionOutcome::Selected { option_id },
            None => PermissionOutcome::Cancelled,
        }
    }
}

/// Pick the option an allow-all policy selects, if any.
fn auto_allow(options: &[PermissionOption]) -> Option<String> {
    let by_kind = |kind: PermissionOptionKind| {
        options
            .iter()
            .find(|o| o.kind == kind)
            .map(|o| o.option_id.clone())
    };
    by_kind(PermissionOptionKind::AllowAlways).or_else(|| by_kind(PermissionOptionKind::AllowOnce))
}
