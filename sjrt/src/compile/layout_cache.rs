//! A single-flight cache of function layouts.
//!
//! Many threads may ask for the layout of the same signature at the same time. Exactly one of
//! them classifies it; the others block on that signature's slot and then share the published
//! layout. Slots for different signatures never block each other, and the map lock is only held
//! long enough to find (or create) a slot.

use super::{
    abi::{classify_func, CallConv, FunctionLayout},
    CompilationError,
};
use crate::ty::FuncTy;
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

type Slot<R> = Arc<Mutex<Option<Arc<FunctionLayout<R>>>>>;

pub(crate) struct LayoutCache<R: 'static> {
    conv: &'static CallConv<R>,
    slots: Mutex<HashMap<FuncTy, Slot<R>>>,
    /// How many layouts have been classified.
    classified: AtomicUsize,
}

impl<R: Copy> LayoutCache<R> {
    pub(crate) fn new(conv: &'static CallConv<R>) -> Self {
        Self {
            conv,
            slots: Mutex::new(HashMap::new()),
            classified: AtomicUsize::new(0),
        }
    }

    /// Return the layout of `fty`, classifying it if no other thread has already done so. If
    /// this call did the classification, `on_new` is called with the new layout before it is
    /// published. Classification failures are returned to every caller that triggers them and
    /// are never cached: the failed signature's slot is removed again.
    pub(crate) fn get<F>(
        &self,
        fty: &FuncTy,
        on_new: F,
    ) -> Result<Arc<FunctionLayout<R>>, CompilationError>
    where
        F: FnOnce(&FunctionLayout<R>),
    {
        let slot_arc = Arc::clone(self.slots.lock().entry(fty.clone()).or_default());
        let mut slot = slot_arc.lock();
        if let Some(layout) = &*slot {
            return Ok(Arc::clone(layout));
        }
        let layout = match classify_func(self.conv, fty) {
            Ok(l) => Arc::new(l),
            Err(e) => {
                // Another thread may already have replaced the slot after an earlier failure.
                let mut slots = self.slots.lock();
                if slots.get(fty).is_some_and(|s| Arc::ptr_eq(s, &slot_arc)) {
                    slots.remove(fty);
                }
                return Err(e);
            }
        };
        on_new(&layout);
        self.classified.fetch_add(1, Ordering::Relaxed);
        *slot = Some(Arc::clone(&layout));
        Ok(layout)
    }

    pub(crate) fn classified(&self) -> usize {
        self.classified.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    fn slots_len(&self) -> usize {
        self.slots.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ty::Ty;
    use std::{sync::Barrier, thread};

    static CONV: CallConv<u8> = CallConv {
        name: "test",
        int_args: &[0, 1],
        float_args: &[2],
        int_rets: &[0],
        float_rets: &[2],
        word: 8,
        spill_slots: true,
        exhaust_on_spill: false,
        by_ref_above: None,
    };

    #[test]
    fn cached() {
        let c = LayoutCache::new(&CONV);
        let fty = FuncTy::new(vec![Ty::Ptr, Ty::Int(64), Ty::Str], vec![Ty::Bool]);
        let l1 = c.get(&fty, |_| ()).unwrap();
        let l2 = c.get(&fty, |_| ()).unwrap();
        assert!(Arc::ptr_eq(&l1, &l2));
        assert_eq!(c.classified(), 1);
        let l3 = c.get(&FuncTy::new(vec![Ty::Ptr], vec![]), |_| ()).unwrap();
        assert!(!Arc::ptr_eq(&l1, &l3));
        assert_eq!(c.classified(), 2);
    }

    #[test]
    fn errors_not_cached() {
        let c = LayoutCache::new(&CONV);
        let fty = FuncTy::new(vec![Ty::Struct(vec![Ty::Ptr])], vec![]);
        assert!(matches!(c.get(&fty, |_| ()), Err(CompilationError::Unsupported(_))));
        assert!(matches!(c.get(&fty, |_| ()), Err(CompilationError::Unsupported(_))));
        assert_eq!(c.classified(), 0);
        assert_eq!(c.slots_len(), 0);
    }

    #[test]
    fn failures_leave_no_slots() {
        let c = LayoutCache::new(&CONV);
        for i in 0..100 {
            let fty = FuncTy::new(vec![Ty::Array(Box::new(Ty::Ptr), i + 1)], vec![]);
            assert!(c.get(&fty, |_| ()).is_err());
        }
        assert_eq!(c.slots_len(), 0);
        c.get(&FuncTy::new(vec![Ty::Ptr], vec![]), |_| ()).unwrap();
        assert_eq!(c.slots_len(), 1);
    }

    #[test]
    fn racing() {
        const THREADS: usize = 16;
        let c = Arc::new(LayoutCache::new(&CONV));
        let ftys = (0..4)
            .map(|i| FuncTy::new(vec![Ty::Int(64); i + 1], vec![Ty::Ptr]))
            .collect::<Vec<_>>();
        let barrier = Arc::new(Barrier::new(THREADS));
        let hs = (0..THREADS)
            .map(|_| {
                let c = Arc::clone(&c);
                let ftys = ftys.clone();
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    ftys.iter()
                        .map(|fty| c.get(fty, |_| ()).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect::<Vec<_>>();
        let results = hs.into_iter().map(|h| h.join().unwrap()).collect::<Vec<_>>();
        for r in &results[1..] {
            for (a, b) in r.iter().zip(results[0].iter()) {
                assert!(Arc::ptr_eq(a, b));
            }
        }
        assert_eq!(c.classified(), ftys.len());
    }
}
