//! A stack high-water mark.

/// Tracks how many bytes of an upwards-growing stack area have been handed out while a calling
/// convention assigns values to stack slots. The mark starts at zero, so its value is also the
/// size of the area so far.
#[derive(Debug, Default)]
pub(crate) struct AbstractStack(usize);

impl AbstractStack {
    /// Round the mark up to a multiple of `to` bytes and return it.
    pub(crate) fn align(&mut self, to: usize) -> usize {
        self.0 = self.0.next_multiple_of(to);
        self.0
    }

    /// Advance the mark by `nbytes` and return it.
    pub(crate) fn grow(&mut self, nbytes: usize) -> usize {
        self.0 += nbytes;
        self.0
    }

    /// Hand out a slot of `nbytes` aligned to `align` bytes, returning the slot's offset.
    pub(crate) fn slot(&mut self, nbytes: usize, align: usize) -> usize {
        let off = self.align(align);
        self.grow(nbytes);
        off
    }

    pub(crate) fn size(&self) -> usize {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::AbstractStack;

    #[test]
    fn grow_and_align() {
        let mut s = AbstractStack::default();
        assert_eq!(s.align(8), 0);
        assert_eq!(s.grow(1), 1);
        assert_eq!(s.align(8), 8);
        assert_eq!(s.align(8), 8);
        assert_eq!(s.grow(0), 8);
        assert_eq!(s.grow(4), 12);
        assert_eq!(s.align(16), 16);
        assert_eq!(s.size(), 16);
    }

    #[test]
    fn slots() {
        let mut s = AbstractStack::default();
        assert_eq!(s.slot(1, 8), 0);
        assert_eq!(s.slot(16, 8), 8);
        assert_eq!(s.slot(0, 8), 24);
        assert_eq!(s.size(), 24);
        assert_eq!(s.slot(4, 4), 24);
        assert_eq!(s.slot(8, 8), 32);
        assert_eq!(s.size(), 40);
    }
}
