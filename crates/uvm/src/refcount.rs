use std::fmt;
use std::num::NonZeroU32;

/// Number of live handles to a shared resource record.
///
/// A stored record always has at least one reference; dropping the last one
/// is reported as [`Release::Last`] so the caller removes the record instead
/// of keeping a zero count around.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RefCount(NonZeroU32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Release {
    Retained(RefCount),
    Last,
}

impl RefCount {
    pub(crate) const ONE: Self = Self(NonZeroU32::MIN);

    pub(crate) fn get(self) -> u32 {
        self.0.get()
    }

    pub(crate) fn acquire(&mut self) {
        self.0 = self.0.saturating_add(1);
    }

    pub(crate) fn release(self) -> Release {
        match NonZeroU32::new(self.0.get() - 1) {
            Some(n) => Release::Retained(Self(n)),
            None => Release::Last,
        }
    }
}

impl Default for RefCount {
    fn default() -> Self {
        Self::ONE
    }
}

impl fmt::Display for RefCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
