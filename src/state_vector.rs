//! State-vector generation and mutation for step 4 (`4.3`, invariant 4).
//!
//! A state vector is a pair of equal-length strings: `primary` (lowercase
//! letters or `#`) and `secondary` (`0`/`1`, aligned to `#`/letter
//! respectively).

use rand::Rng;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateVector {
    pub primary: Vec<char>,
    pub secondary: Vec<char>,
}

fn random_letter(rng: &mut impl Rng) -> char {
    (b'a' + rng.gen_range(0..26)) as char
}

impl StateVector {
    /// A fully empty vector of the given length.
    pub fn empty(len: usize) -> Self {
        Self {
            primary: vec!['#'; len],
            secondary: vec!['0'; len],
        }
    }

    /// Initial vector: fill-ratio 0.1, positions chosen uniformly at random.
    pub fn initial(len: usize, rng: &mut impl Rng) -> Self {
        let mut vector = Self::empty(len);
        let fill_count = ((len as f64) * 0.1).round() as usize;
        let mut positions: Vec<usize> = (0..len).collect();
        shuffle(&mut positions, rng);
        for &pos in positions.iter().take(fill_count) {
            vector.primary[pos] = random_letter(rng);
            vector.secondary[pos] = '1';
        }
        vector
    }

    /// Picks `k ∈ [1, min(5, len)]` distinct positions and flips each
    /// between empty and a fresh random letter.
    pub fn mutate(&mut self, rng: &mut impl Rng) {
        if self.primary.is_empty() {
            return;
        }
        let max_k = self.primary.len().min(5);
        let k = rng.gen_range(1..=max_k);

        let mut positions: Vec<usize> = (0..self.primary.len()).collect();
        shuffle(&mut positions, rng);

        for &pos in positions.iter().take(k) {
            if self.secondary[pos] == '1' {
                self.primary[pos] = '#';
                self.secondary[pos] = '0';
            } else {
                self.primary[pos] = random_letter(rng);
                self.secondary[pos] = '1';
            }
        }
    }

    /// Every position filled with a fresh random letter.
    pub fn complete(len: usize, rng: &mut impl Rng) -> Self {
        let primary = (0..len).map(|_| random_letter(rng)).collect();
        let secondary = vec!['1'; len];
        Self { primary, secondary }
    }

    pub fn primary_state(&self) -> String {
        self.primary.iter().collect()
    }

    pub fn secondary_state(&self) -> String {
        self.secondary.iter().collect()
    }

    /// Invariant 4 self-check: lengths match and character-set rules hold.
    pub fn is_well_formed(&self, expected_len: usize) -> bool {
        if self.primary.len() != expected_len || self.secondary.len() != expected_len {
            return false;
        }
        self.primary
            .iter()
            .zip(self.secondary.iter())
            .all(|(&p, &s)| match s {
                '0' => p == '#',
                '1' => p.is_ascii_lowercase(),
                _ => false,
            })
    }
}

fn shuffle<T>(items: &mut [T], rng: &mut impl Rng) {
    for i in (1..items.len()).rev() {
        let j = rng.gen_range(0..=i);
        items.swap(i, j);
    }
}
