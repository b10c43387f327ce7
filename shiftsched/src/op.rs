use crate::helpe::*;

/// Inserts `x` into the sorted vector `v` unless already present.
/// Returns whether an insertion happened.
#[inline(always)]
pub(crate) fn insert_sorted<T: Ord + Copy>(v: &mut Vec<T>, x: T) -> bool {
    match v.binary_search(&x) {
        Ok(_)       => false,
        Err(pos)    => {
            v.insert(pos, x);
            true
        }
    }
}

/// Removes `x` from the sorted vector `v` if present.
#[inline(always)]
pub(crate) fn remove_sorted<T: Ord + Copy>(v: &mut Vec<T>, x: T) -> bool {
    match v.binary_search(&x) {
        Ok(pos)     => {
            v.remove(pos);
            true
        },
        Err(_)      => false,
    }
}

impl Op {
    pub fn new(address: OpAddress, debug_name: &str) -> Self {
        Self {
            address,
            ins:        vec![],
            outs:       vec![],
            allocs:     vec![],
            fwd_link:   None,
            bwd_link:   None,
            debug_name: debug_name.to_string(),
        }
    }

    #[inline(always)]
    pub fn address(&self) -> OpAddress { self.address }
    #[inline(always)]
    pub fn ins(&self) -> &[OpAddress] { &self.ins }
    #[inline(always)]
    pub fn outs(&self) -> &[OpAddress] { &self.outs }
    #[inline(always)]
    pub fn allocs(&self) -> &[AllocAddress] { &self.allocs }
    #[inline(always)]
    pub fn n_ins(&self) -> usize { self.ins.len() }
    #[inline(always)]
    pub fn n_outs(&self) -> usize { self.outs.len() }
    #[inline(always)]
    pub fn n_allocs(&self) -> usize { self.allocs.len() }
    #[inline(always)]
    pub fn debug_name(&self) -> &str { &self.debug_name }
    #[inline(always)]
    pub fn fwd_link(&self) -> Option<OpAddress> { self.fwd_link }
    #[inline(always)]
    pub fn bwd_link(&self) -> Option<OpAddress> { self.bwd_link }
    #[inline(always)]
    pub fn has_fwd_link(&self) -> bool { self.fwd_link.is_some() }
    #[inline(always)]
    pub fn has_bwd_link(&self) -> bool { self.bwd_link.is_some() }

    #[inline(always)]
    pub fn has_in(&self, x: OpAddress) -> bool { self.ins.binary_search(&x).is_ok() }
    #[inline(always)]
    pub fn has_out(&self, x: OpAddress) -> bool { self.outs.binary_search(&x).is_ok() }
    #[inline(always)]
    pub fn has_alloc(&self, x: AllocAddress) -> bool { self.allocs.binary_search(&x).is_ok() }

    pub(crate) fn insert_in(&mut self, x: OpAddress) -> bool { insert_sorted(&mut self.ins, x) }
    pub(crate) fn insert_out(&mut self, x: OpAddress) -> bool { insert_sorted(&mut self.outs, x) }
    pub(crate) fn insert_alloc(&mut self, x: AllocAddress) -> bool { insert_sorted(&mut self.allocs, x) }
    pub(crate) fn remove_in(&mut self, x: OpAddress) -> bool { remove_sorted(&mut self.ins, x) }
    pub(crate) fn remove_out(&mut self, x: OpAddress) -> bool { remove_sorted(&mut self.outs, x) }
    pub(crate) fn remove_alloc(&mut self, x: AllocAddress) -> bool { remove_sorted(&mut self.allocs, x) }

    /// Comparison key which ignores the debug name. `ins` and
    /// `bwd_link` are implied by the other ops' keys.
    pub(crate) fn nameless_key(&self) -> (OpAddress, Option<OpAddress>, &[OpAddress], &[AllocAddress]) {
        (self.address, self.fwd_link, &self.outs, &self.allocs)
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.debug_name, self.address)
    }
}

impl Alloc {
    pub fn new(address: AllocAddress, weight: AllocWeight) -> Self {
        Self {
            address,
            weight,
            ops: vec![],
        }
    }

    #[inline(always)]
    pub fn address(&self) -> AllocAddress { self.address }
    #[inline(always)]
    pub fn weight(&self) -> AllocWeight { self.weight }
    #[inline(always)]
    pub fn ops(&self) -> &[OpAddress] { &self.ops }
    #[inline(always)]
    pub fn n_ops(&self) -> usize { self.ops.len() }
    #[inline(always)]
    pub fn has_op(&self, x: OpAddress) -> bool { self.ops.binary_search(&x).is_ok() }

    pub(crate) fn insert_op(&mut self, x: OpAddress) -> bool { insert_sorted(&mut self.ops, x) }
    pub(crate) fn remove_op(&mut self, x: OpAddress) -> bool { remove_sorted(&mut self.ops, x) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sorted_helpers() {
        let mut v = vec![];
        assert!(insert_sorted(&mut v, 3));
        assert!(insert_sorted(&mut v, 1));
        assert!(!insert_sorted(&mut v, 3));
        assert_eq!(v, vec![1, 3]);
        assert!(remove_sorted(&mut v, 1));
        assert!(!remove_sorted(&mut v, 1));
        assert_eq!(v, vec![3]);
    }
}
