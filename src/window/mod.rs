//! The windowing family (§4.8–4.10) and the collector that re-aggregates
//! windowed `Res<T>` by window identity (§4.11).
//!
//! Each windowing processor attaches [`WindowMetadata`](crate::metadata::WindowMetadata)
//! to every `Res<T>` it emits rather than producing a `Window<T>` aggregate
//! directly — this keeps `Res<T>` the single uniform type that flows through
//! `Filter`/`Mapper`/`Switch` and every other processor, at the cost of
//! metadata duplication (acceptable at the 1K–10K items/window scale these
//! processors target; see DESIGN.md).

pub mod collector;
pub mod session;
pub mod sliding;
pub mod tumbling;

pub use collector::WindowCollector;
pub use session::SessionWindow;
pub use sliding::SlidingWindow;
pub use tumbling::TumblingWindow;
