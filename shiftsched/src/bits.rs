/// Number of bits per storage word.
pub const WORD_BITS: usize = u64::BITS as usize;

/// A fixed-width row of bits, packed into 64 bit words.
///
/// Rows of the transitive closure are `n` bits wide, `n` being the
/// number of ops in the row's component. Bits past `n` in the last
/// word are kept at zero so that counting and comparing rows never
/// needs masking.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct BitRow {
    words:  Vec<u64>,
    n_bits: usize,
}

#[inline(always)]
pub fn n_words(n_bits: usize) -> usize {
    n_bits / WORD_BITS + (n_bits % WORD_BITS != 0) as usize
}

impl BitRow {
    pub fn zeros(n_bits: usize) -> Self {
        Self {
            words: vec![0; n_words(n_bits)],
            n_bits,
        }
    }

    pub fn ones(n_bits: usize) -> Self {
        let mut res = Self {
            words: vec![u64::MAX; n_words(n_bits)],
            n_bits,
        };
        res.clear_tail();

        res
    }

    #[inline(always)]
    fn clear_tail(&mut self) {
        let rem = self.n_bits % WORD_BITS;
        if rem != 0 {
            if let Some(last) = self.words.last_mut() {
                *last &= (1u64 << rem) - 1;
            }
        }
    }

    #[inline(always)]
    pub fn get(&self, i: usize) -> bool {
        debug_assert!(i < self.n_bits);
        (self.words[i / WORD_BITS] >> (i % WORD_BITS)) & 1 == 1
    }

    #[inline(always)]
    pub fn set(&mut self, i: usize) {
        debug_assert!(i < self.n_bits);
        self.words[i / WORD_BITS] |= 1u64 << (i % WORD_BITS);
    }

    #[inline(always)]
    pub fn clear(&mut self, i: usize) {
        debug_assert!(i < self.n_bits);
        self.words[i / WORD_BITS] &= !(1u64 << (i % WORD_BITS));
    }

    #[inline(always)]
    pub fn or_assign(&mut self, other: &Self) {
        debug_assert_eq!(self.n_bits, other.n_bits);
        self.words.iter_mut().zip(other.words.iter()).for_each(|(a, b)| *a |= b);
    }

    #[inline(always)]
    pub fn and_assign(&mut self, other: &Self) {
        debug_assert_eq!(self.n_bits, other.n_bits);
        self.words.iter_mut().zip(other.words.iter()).for_each(|(a, b)| *a &= b);
    }

    /// `self &= !other`
    #[inline(always)]
    pub fn and_not_assign(&mut self, other: &Self) {
        debug_assert_eq!(self.n_bits, other.n_bits);
        self.words.iter_mut().zip(other.words.iter()).for_each(|(a, b)| *a &= !b);
    }

    pub fn clear_all(&mut self) {
        self.words.iter_mut().for_each(|w| *w = 0);
    }

    #[inline(always)]
    pub fn count_ones(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Indices of all set bits, ascending.
    pub fn iter_ones(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter()
            .enumerate()
            .flat_map(|(wi, &w)| {
                let mut rest = w;
                std::iter::from_fn(move || {
                    if rest == 0 { return None; }
                    let tz = rest.trailing_zeros() as usize;
                    rest &= rest - 1;
                    Some(wi * WORD_BITS + tz)
                })
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ones_masks_tail() {
        let r = BitRow::ones(70);
        assert_eq!(r.count_ones(), 70);
        assert_eq!(r.iter_ones().last(), Some(69));
        assert_eq!(BitRow::ones(64).count_ones(), 64);
        assert_eq!(BitRow::ones(0).count_ones(), 0);
    }

    #[test]
    fn set_ops() {
        let mut a = BitRow::zeros(130);
        a.set(0);
        a.set(64);
        a.set(129);
        assert!(a.get(129) && !a.get(128));
        assert_eq!(a.iter_ones().collect::<Vec<_>>(), vec![0, 64, 129]);
        let mut b = BitRow::ones(130);
        b.and_not_assign(&a);
        assert_eq!(b.count_ones(), 127);
        assert!(a.iter_ones().all(|i| !b.get(i)));
        b.or_assign(&a);
        assert_eq!(b, BitRow::ones(130));
        b.and_assign(&a);
        assert_eq!(b, a);
        b.clear(64);
        assert_eq!(b.count_ones(), 2);
    }
}
