//! The well-known metadata key registry and the opaque value type attached
//! to a [`Res<T>`](crate::result::Res).

use std::time::{Duration, SystemTime};

/// Time of emission by the emitting processor.
pub const TIMESTAMP: &str = "timestamp";
/// Name of the most recent processor to touch this item.
pub const PROCESSOR: &str = "processor";
/// A [`WindowMetadata`] attached by a windowing processor.
pub const WINDOW: &str = "window";
/// The route key chosen by Switch/Router/Partition.
pub const ROUTE: &str = "route";

/// Opaque metadata value. Kept as a closed enum rather than `Box<dyn Any>`
/// so the hot-path metadata map never allocates per-access for the cases
/// every processor actually needs.
#[derive(Debug, Clone)]
pub enum Metadata {
    Str(String),
    U64(u64),
    Duration(Duration),
    Window(WindowMetadata),
}

impl Metadata {
    pub fn as_window(&self) -> Option<&WindowMetadata> {
        match self {
            Metadata::Window(w) => Some(w),
            _ => None,
        }
    }

    pub fn as_duration(&self) -> Option<Duration> {
        match self {
            Metadata::Duration(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Metadata::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Metadata::U64(n) => Some(*n),
            _ => None,
        }
    }
}

/// Which family of window produced a [`WindowMetadata`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowKind {
    Tumbling,
    Sliding,
    Session,
}

/// Window bounds and provenance attached to every `Res<T>` a windowing
/// processor emits.
#[derive(Debug, Clone, Copy)]
pub struct WindowMetadata {
    pub start: SystemTime,
    pub end: SystemTime,
    pub kind: WindowKind,
    pub size: Option<Duration>,
    pub slide: Option<Duration>,
    pub gap: Option<Duration>,
}

impl WindowMetadata {
    /// Stack-comparable identity for a window, used as the aggregation key
    /// by [`crate::window::collector::WindowCollector`]. Avoids any heap
    /// allocation (no string keys) on the hot aggregation path.
    pub fn id(&self) -> WindowId {
        let to_nanos = |t: SystemTime| {
            t.duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos() as i128
        };
        WindowId {
            start_nanos: to_nanos(self.start),
            end_nanos: to_nanos(self.end),
        }
    }
}

/// A stack-comparable window identity: two results with the same
/// `WindowId` belong to the same logical window, regardless of the
/// windowing strategy that produced them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WindowId {
    pub start_nanos: i128,
    pub end_nanos: i128,
}
