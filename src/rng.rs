/// Seedable mulberry32 generator. Every participant that starts from the same
/// seed draws the same stream, which is what lets peers rebuild a map from a
/// seed instead of receiving the full grid.
#[derive(Clone, Debug)]
pub struct Rng {
    seed: u32,
}

impl Rng {
    pub fn new(seed: u32) -> Self {
        Self { seed }
    }

    pub fn next_f64(&mut self) -> f64 {
        self.seed = self.seed.wrapping_add(0x6d2b79f5);
        let mut t = self.seed;
        t = (t ^ (t >> 15)).wrapping_mul(t | 1);
        t ^= t.wrapping_add((t ^ (t >> 7)).wrapping_mul(t | 61));
        let out = t ^ (t >> 14);
        out as f64 / 4_294_967_296.0
    }

    /// Uniform integer in `[min, max]`, both ends inclusive.
    pub fn int(&mut self, min: i32, max: i32) -> i32 {
        if max <= min {
            return min;
        }
        let span = (max - min + 1) as f64;
        min + (self.next_f64() * span).floor() as i32
    }

    pub fn bool(&mut self, probability: f64) -> bool {
        self.next_f64() < probability
    }

    pub fn pick_index(&mut self, len: usize) -> usize {
        if len <= 1 {
            return 0;
        }
        (self.next_f64() * len as f64).floor().min((len - 1) as f64) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_stream() {
        let mut a = Rng::new(42);
        let mut b = Rng::new(42);
        for _ in 0..1_000 {
            assert_eq!(a.next_f64().to_bits(), b.next_f64().to_bits());
        }
    }

    #[test]
    fn int_stays_inside_inclusive_range() {
        let mut rng = Rng::new(7);
        let mut saw_min = false;
        let mut saw_max = false;
        for _ in 0..5_000 {
            let value = rng.int(-2, 2);
            assert!((-2..=2).contains(&value));
            saw_min |= value == -2;
            saw_max |= value == 2;
        }
        assert!(saw_min && saw_max);
    }

    #[test]
    fn pick_index_never_overflows() {
        let mut rng = Rng::new(99);
        assert_eq!(rng.pick_index(0), 0);
        assert_eq!(rng.pick_index(1), 0);
        for _ in 0..5_000 {
            assert!(rng.pick_index(3) < 3);
        }
    }
}
