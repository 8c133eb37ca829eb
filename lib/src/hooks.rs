// Copyright 2025 The Tract Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The hook surface. Mutating operations describe their proposed change as a
//! structured plan; a registered handler may approve, reject, or modify
//! named fields. Handlers run with a re-entrancy flag set, so an operation
//! performed from inside a handler fires no further hooks (this is what
//! keeps a compress → compile → policy → compress loop from forming).

use std::cell::Cell;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

/// What a handler decided about a proposed change.
#[derive(Clone, Debug, PartialEq)]
pub enum HookVerdict {
    Approve,
    Reject { reason: String },
    /// Field-wise overrides merged over the plan. Only top-level keys the
    /// operation documents as modifiable take effect.
    Modify(serde_json::Value),
}

/// Outcome of firing a hook, after merging any modifications.
#[derive(Clone, Debug, PartialEq)]
pub enum HookOutcome {
    Approved { plan: serde_json::Value },
    Rejected { reason: String },
}

pub type HookHandler = Rc<dyn Fn(&str, &serde_json::Value) -> HookVerdict>;

/// Per-handle registry of hook handlers, keyed by operation name
/// (`commit`, `merge`, `rebase`, `import`, `compress`, `gc`).
#[derive(Default)]
pub struct HookRegistry {
    handlers: RefCell<HashMap<String, HookHandler>>,
    firing: Cell<bool>,
}

impl fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookRegistry")
            .field(
                "operations",
                &self.handlers.borrow().keys().cloned().collect::<Vec<_>>(),
            )
            .field("firing", &self.firing.get())
            .finish()
    }
}

impl HookRegistry {
    pub fn register(
        &self,
        operation: impl Into<String>,
        handler: impl Fn(&str, &serde_json::Value) -> HookVerdict + 'static,
    ) {
        self.handlers
            .borrow_mut()
            .insert(operation.into(), Rc::new(handler));
    }

    pub fn unregister(&self, operation: &str) {
        self.handlers.borrow_mut().remove(operation);
    }

    /// Fires the hook for `operation` with the proposed plan. Without a
    /// handler, or while another handler is already executing (the
    /// re-entrancy guard), the plan auto-approves unchanged.
    pub fn fire(&self, operation: &str, plan: serde_json::Value) -> HookOutcome {
        if self.firing.get() {
            return HookOutcome::Approved { plan };
        }
        let handler = self.handlers.borrow().get(operation).cloned();
        let Some(handler) = handler else {
            return HookOutcome::Approved { plan };
        };
        self.firing.set(true);
        let verdict = handler(operation, &plan);
        self.firing.set(false);
        match verdict {
            HookVerdict::Approve => HookOutcome::Approved { plan },
            HookVerdict::Reject { reason } => HookOutcome::Rejected { reason },
            HookVerdict::Modify(patch) => {
                let mut plan = plan;
                if let (Some(plan_map), Some(patch_map)) = (plan.as_object_mut(), patch.as_object())
                {
                    for (key, value) in patch_map {
                        plan_map.insert(key.clone(), value.clone());
                    }
                }
                HookOutcome::Approved { plan }
            }
        }
    }
}

/// A proposed change returned to the caller instead of being applied, for
/// collaborative operations. The caller edits the draft and hands it back to
/// the operation's `apply` entry point.
#[derive(Clone, Debug, PartialEq)]
pub struct Pending<T> {
    pub operation: &'static str,
    pub draft: T,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_handler_auto_approves() {
        let registry = HookRegistry::default();
        let outcome = registry.fire("commit", serde_json::json!({"message": "m"}));
        assert_eq!(
            outcome,
            HookOutcome::Approved {
                plan: serde_json::json!({"message": "m"})
            }
        );
    }

    #[test]
    fn test_reject_carries_reason() {
        let registry = HookRegistry::default();
        registry.register("compress", |_, _| HookVerdict::Reject {
            reason: "not now".to_string(),
        });
        let outcome = registry.fire("compress", serde_json::json!({}));
        assert_eq!(
            outcome,
            HookOutcome::Rejected {
                reason: "not now".to_string()
            }
        );
        // Other operations are unaffected.
        assert_matches::assert_matches!(
            registry.fire("commit", serde_json::json!({})),
            HookOutcome::Approved { .. }
        );
    }

    #[test]
    fn test_modify_merges_fields() {
        let registry = HookRegistry::default();
        registry.register("commit", |_, _| {
            HookVerdict::Modify(serde_json::json!({"message": "rewritten"}))
        });
        let outcome = registry.fire(
            "commit",
            serde_json::json!({"message": "original", "tokens": 3}),
        );
        assert_eq!(
            outcome,
            HookOutcome::Approved {
                plan: serde_json::json!({"message": "rewritten", "tokens": 3})
            }
        );
    }

    #[test]
    fn test_reentrancy_guard_suppresses_nested_fire() {
        let registry = Rc::new(HookRegistry::default());
        let inner_registry = registry.clone();
        let nested = Rc::new(RefCell::new(None));
        let nested_ref = nested.clone();
        registry.register("commit", move |_, _| {
            // A nested fire from inside the handler must auto-approve
            // without invoking the handler again.
            let outcome = inner_registry.fire("commit", serde_json::json!({"nested": true}));
            *nested_ref.borrow_mut() = Some(outcome);
            HookVerdict::Reject {
                reason: "outer".to_string(),
            }
        });

        let outcome = registry.fire("commit", serde_json::json!({}));
        assert_eq!(
            outcome,
            HookOutcome::Rejected {
                reason: "outer".to_string()
            }
        );
        assert_eq!(
            nested.borrow_mut().take().unwrap(),
            HookOutcome::Approved {
                plan: serde_json::json!({"nested": true})
            }
        );
    }
}
