//! Trigger engine: the trigger expression language, one-shot expression
//! triggers, tags shared between triggers, and the periodic / toggle
//! triggers that drive report updates.

mod expr;
mod periodic;
mod runtime;
mod tags;

pub use expr::{Edge, TimeUnit, TriggerAtom, TriggerExpr, TriggerKind, TriggerKindCounts};
pub use periodic::{PeriodicTrigger, TimeTrigger, ToggleTrigger, UpdatePeriod};
pub use runtime::{ExpressionTrigger, TriggerContext, TriggerSpec};
pub use tags::{TagListenerId, TagRegistry};
