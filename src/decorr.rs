// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Decorrelation (prediction) passes.

use crate::constant::decorr::CROSS_WEIGHT_LIMIT;
use crate::constant::decorr::MAX_TERM;
use crate::constant::decorr::WEIGHT_LIMIT;

/// Predictor type of a decorrelation pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Term {
    /// Predicts from the sample `n` (1-8) steps back in the same channel.
    Delay(u8),
    /// Linear extrapolation from the last two samples (code 17).
    Linear,
    /// Damped extrapolation from the last two samples (code 18).
    Damped,
    /// Left from previous right, then right from current left (code -1).
    CrossLeft,
    /// Right from previous left, then left from current right (code -2).
    CrossRight,
    /// Each channel from the other channel's previous sample (code -3).
    CrossBoth,
}

impl Term {
    /// Converts the stored term code. Returns `None` for invalid codes.
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            1..=8 => Some(Self::Delay(code as u8)),
            17 => Some(Self::Linear),
            18 => Some(Self::Damped),
            -1 => Some(Self::CrossLeft),
            -2 => Some(Self::CrossRight),
            -3 => Some(Self::CrossBoth),
            _ => None,
        }
    }

    /// Returns the code used in the bitstream.
    pub const fn code(self) -> i32 {
        match self {
            Self::Delay(n) => n as i32,
            Self::Linear => 17,
            Self::Damped => 18,
            Self::CrossLeft => -1,
            Self::CrossRight => -2,
            Self::CrossBoth => -3,
        }
    }

    /// Returns true if the pass mixes both channels.
    pub const fn is_cross(self) -> bool {
        matches!(self, Self::CrossLeft | Self::CrossRight | Self::CrossBoth)
    }

    /// Returns the number of history samples per channel stored in the
    /// decorrelation-samples sub-block.
    pub const fn history_len(self) -> usize {
        match self {
            Self::Delay(n) => n as usize,
            Self::Linear | Self::Damped => 2,
            Self::CrossLeft | Self::CrossRight | Self::CrossBoth => 1,
        }
    }
}

/// Converts an 8-bit stored weight to the 10-bit fixed-point weight.
///
/// # Examples
///
/// ```
/// # use wvdec::decorr::restore_weight;
/// assert_eq!(restore_weight(127), 1024);
/// assert_eq!(restore_weight(-128), -1024);
/// assert_eq!(restore_weight(0), 0);
/// ```
pub fn restore_weight(weight: i8) -> i32 {
    let w = i32::from(weight) << 3;
    if w > 0 {
        w + ((w + 64) >> 7)
    } else {
        w
    }
}

/// Multiplies `sample` by a 10-bit fixed-point `weight`.
///
/// Samples outside of the 16-bit range are multiplied in two halves to stay
/// within 32-bit arithmetic.
#[inline]
pub fn apply_weight(weight: i32, sample: i32) -> i32 {
    if i32::from(sample as i16) == sample {
        weight.wrapping_mul(sample).wrapping_add(512) >> 10
    } else {
        let lo = ((sample & 0xffff).wrapping_mul(weight)) >> 9;
        let hi = ((sample & !0xffff) >> 9).wrapping_mul(weight);
        lo.wrapping_add(hi).wrapping_add(1) >> 1
    }
}

/// Moves `weight` by `delta` towards the sign agreement of `source` and
/// `result`, saturating at `limit`.
#[inline]
fn update_weight(weight: &mut i32, delta: i32, source: i32, result: i32, limit: i32) {
    if source != 0 && result != 0 {
        *weight = if (source ^ result) < 0 {
            weight.saturating_sub(delta)
        } else {
            weight.saturating_add(delta)
        }
        .clamp(-limit, limit);
    }
}

/// One adaptive prediction filter with its per-channel history.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecorrPass {
    pub term: Term,
    /// Adaptation step of the weights.
    pub delta: i32,
    pub weight_a: i32,
    pub weight_b: i32,
    /// History of the first (left or mono) channel.
    pub samples_a: [i32; MAX_TERM],
    /// History of the second (right) channel.
    pub samples_b: [i32; MAX_TERM],
    cursor: usize,
}

impl DecorrPass {
    /// Constructs a pass with zero weights and history.
    pub const fn new(term: Term, delta: i32) -> Self {
        Self {
            term,
            delta,
            weight_a: 0,
            weight_b: 0,
            samples_a: [0; MAX_TERM],
            samples_b: [0; MAX_TERM],
            cursor: 0,
        }
    }

    /// Zeroes the sample history, keeping the term and the weights.
    pub fn clear_history(&mut self) {
        self.samples_a = [0; MAX_TERM];
        self.samples_b = [0; MAX_TERM];
        self.cursor = 0;
    }

    const fn weight_limit(&self) -> i32 {
        if self.term.is_cross() {
            CROSS_WEIGHT_LIMIT
        } else {
            WEIGHT_LIMIT
        }
    }

    /// Reconstructs mono samples in place from their residuals.
    ///
    /// Cross-channel terms are not valid for mono data and leave the buffer
    /// untouched.
    pub fn decorr_mono(&mut self, buffer: &mut [i32]) {
        let limit = self.weight_limit();
        let delta = self.delta;
        match self.term {
            Term::Linear | Term::Damped => {
                let linear = self.term == Term::Linear;
                for x in buffer.iter_mut() {
                    let sam = extrapolate(&self.samples_a, linear);
                    self.samples_a[1] = self.samples_a[0];
                    self.samples_a[0] = apply_weight(self.weight_a, sam).wrapping_add(*x);
                    update_weight(&mut self.weight_a, delta, sam, *x, limit);
                    *x = self.samples_a[0];
                }
            }
            Term::Delay(n) => {
                let n = usize::from(n);
                for x in buffer.iter_mut() {
                    let m = self.cursor;
                    let k = (m + n) & (MAX_TERM - 1);
                    let sam = self.samples_a[m];
                    self.samples_a[k] = apply_weight(self.weight_a, sam).wrapping_add(*x);
                    update_weight(&mut self.weight_a, delta, sam, *x, limit);
                    *x = self.samples_a[k];
                    self.cursor = (m + 1) & (MAX_TERM - 1);
                }
            }
            Term::CrossLeft | Term::CrossRight | Term::CrossBoth => {}
        }
    }

    /// Reconstructs interleaved stereo samples in place from their residuals.
    pub fn decorr_stereo(&mut self, buffer: &mut [i32]) {
        let limit = self.weight_limit();
        let delta = self.delta;
        match self.term {
            Term::Linear | Term::Damped => {
                let linear = self.term == Term::Linear;
                for frame in buffer.chunks_exact_mut(2) {
                    let sam = extrapolate(&self.samples_a, linear);
                    self.samples_a[1] = self.samples_a[0];
                    self.samples_a[0] = apply_weight(self.weight_a, sam).wrapping_add(frame[0]);
                    update_weight(&mut self.weight_a, delta, sam, frame[0], limit);
                    frame[0] = self.samples_a[0];

                    let sam = extrapolate(&self.samples_b, linear);
                    self.samples_b[1] = self.samples_b[0];
                    self.samples_b[0] = apply_weight(self.weight_b, sam).wrapping_add(frame[1]);
                    update_weight(&mut self.weight_b, delta, sam, frame[1], limit);
                    frame[1] = self.samples_b[0];
                }
            }
            Term::Delay(n) => {
                let n = usize::from(n);
                for frame in buffer.chunks_exact_mut(2) {
                    let m = self.cursor;
                    let k = (m + n) & (MAX_TERM - 1);

                    let sam = self.samples_a[m];
                    self.samples_a[k] = apply_weight(self.weight_a, sam).wrapping_add(frame[0]);
                    update_weight(&mut self.weight_a, delta, sam, frame[0], limit);
                    frame[0] = self.samples_a[k];

                    let sam = self.samples_b[m];
                    self.samples_b[k] = apply_weight(self.weight_b, sam).wrapping_add(frame[1]);
                    update_weight(&mut self.weight_b, delta, sam, frame[1], limit);
                    frame[1] = self.samples_b[k];

                    self.cursor = (m + 1) & (MAX_TERM - 1);
                }
            }
            Term::CrossLeft => {
                for frame in buffer.chunks_exact_mut(2) {
                    let left = frame[0].wrapping_add(apply_weight(self.weight_a, self.samples_a[0]));
                    update_weight(&mut self.weight_a, delta, self.samples_a[0], frame[0], limit);
                    frame[0] = left;
                    self.samples_a[0] = frame[1].wrapping_add(apply_weight(self.weight_b, left));
                    update_weight(&mut self.weight_b, delta, left, frame[1], limit);
                    frame[1] = self.samples_a[0];
                }
            }
            Term::CrossRight => {
                for frame in buffer.chunks_exact_mut(2) {
                    let right =
                        frame[1].wrapping_add(apply_weight(self.weight_b, self.samples_b[0]));
                    update_weight(&mut self.weight_b, delta, self.samples_b[0], frame[1], limit);
                    frame[1] = right;
                    self.samples_b[0] = frame[0].wrapping_add(apply_weight(self.weight_a, right));
                    update_weight(&mut self.weight_a, delta, right, frame[0], limit);
                    frame[0] = self.samples_b[0];
                }
            }
            Term::CrossBoth => {
                for frame in buffer.chunks_exact_mut(2) {
                    let left = frame[0].wrapping_add(apply_weight(self.weight_a, self.samples_a[0]));
                    update_weight(&mut self.weight_a, delta, self.samples_a[0], frame[0], limit);
                    let right =
                        frame[1].wrapping_add(apply_weight(self.weight_b, self.samples_b[0]));
                    update_weight(&mut self.weight_b, delta, self.samples_b[0], frame[1], limit);
                    self.samples_b[0] = left;
                    self.samples_a[0] = right;
                    frame[0] = left;
                    frame[1] = right;
                }
            }
        }
    }
}

/// Predicts the next sample from the last two (`hist[0]` is the latest).
#[inline]
const fn extrapolate(hist: &[i32; MAX_TERM], linear: bool) -> i32 {
    if linear {
        hist[0].wrapping_mul(2).wrapping_sub(hist[1])
    } else {
        hist[0].wrapping_mul(3).wrapping_sub(hist[1]) >> 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rstest::rstest;

    fn pass(term: Term, delta: i32, weight: i32) -> DecorrPass {
        let mut p = DecorrPass::new(term, delta);
        p.weight_a = weight;
        p.weight_b = weight;
        p
    }

    #[rstest]
    #[case(1, 8)]
    #[case(-1, -8)]
    #[case(64, 516)]
    #[case(127, 1024)]
    #[case(-128, -1024)]
    fn restore_weight_values(#[case] stored: i8, #[case] expected: i32) {
        assert_eq!(restore_weight(stored), expected);
    }

    #[rstest]
    fn unit_weight_is_identity(#[values(0, 1, -1, 100, -32768, 32767, 100_000, -100_000, 8_388_607)] x: i32) {
        assert_eq!(apply_weight(1024, x), x);
    }

    #[test]
    fn half_weight_rounds_towards_floor() {
        assert_eq!(apply_weight(512, -1000), -500);
        assert_eq!(apply_weight(512, 1001), 501);
    }

    #[rstest]
    #[case(-3, Some(Term::CrossBoth))]
    #[case(-1, Some(Term::CrossLeft))]
    #[case(0, None)]
    #[case(5, Some(Term::Delay(5)))]
    #[case(9, None)]
    #[case(16, None)]
    #[case(17, Some(Term::Linear))]
    #[case(18, Some(Term::Damped))]
    #[case(19, None)]
    #[case(-4, None)]
    fn term_codes(#[case] code: i32, #[case] expected: Option<Term>) {
        assert_eq!(Term::from_code(code), expected);
        if let Some(t) = expected {
            assert_eq!(t.code(), code);
        }
    }

    #[test]
    fn delay_one_accumulates() {
        let mut p = pass(Term::Delay(1), 0, 1024);
        let mut buf = vec![1, 2, 3, 4];
        p.decorr_mono(&mut buf);
        assert_eq!(buf, vec![1, 3, 6, 10]);
    }

    #[test]
    fn delay_two_skips_one() {
        let mut p = pass(Term::Delay(2), 0, 1024);
        let mut buf = vec![1, 2, 3, 4];
        p.decorr_mono(&mut buf);
        assert_eq!(buf, vec![1, 2, 4, 6]);
    }

    #[test]
    fn linear_and_damped_extrapolation() {
        let mut p = pass(Term::Linear, 0, 1024);
        let mut buf = vec![1, 1, 1, 1];
        p.decorr_mono(&mut buf);
        assert_eq!(buf, vec![1, 3, 6, 10]);

        let mut p = pass(Term::Damped, 0, 1024);
        let mut buf = vec![2, 0, 0];
        p.decorr_mono(&mut buf);
        assert_eq!(buf, vec![2, 3, 3]);
    }

    #[test]
    fn weights_adapt_with_sign_agreement() {
        let mut p = pass(Term::Delay(1), 2, 0);
        let mut buf = vec![5, 5];
        p.decorr_mono(&mut buf);
        assert_eq!(buf, vec![5, 5]);
        assert_eq!(p.weight_a, 2);

        let mut buf = vec![-5];
        p.decorr_mono(&mut buf);
        assert_eq!(buf, vec![-5]);
        assert_eq!(p.weight_a, 0);
    }

    #[test]
    fn cross_weights_saturate() {
        let mut p = pass(Term::CrossBoth, 8, 1020);
        p.samples_a[0] = 10;
        p.samples_b[0] = 10;
        let mut buf = vec![1, 1];
        p.decorr_stereo(&mut buf);
        assert_eq!(p.weight_a, CROSS_WEIGHT_LIMIT);
        assert_eq!(p.weight_b, CROSS_WEIGHT_LIMIT);
    }

    #[test]
    fn plain_weights_saturate() {
        let mut p = pass(Term::Delay(1), 7, WEIGHT_LIMIT - 3);
        p.samples_a[0] = 1;
        let mut buf = vec![1];
        p.decorr_mono(&mut buf);
        assert_eq!(p.weight_a, WEIGHT_LIMIT);
    }

    #[rstest]
    #[case::left(Term::CrossLeft, vec![1, 1, 1, 1], vec![1, 2, 3, 4])]
    #[case::right(Term::CrossRight, vec![1, 1, 1, 1], vec![2, 1, 4, 3])]
    #[case::both(Term::CrossBoth, vec![1, 0, 0, 0, 0, 0], vec![1, 0, 0, 1, 1, 0])]
    fn cross_channel_terms(#[case] term: Term, #[case] input: Vec<i32>, #[case] expected: Vec<i32>) {
        let mut p = pass(term, 0, 1024);
        let mut buf = input;
        p.decorr_stereo(&mut buf);
        assert_eq!(buf, expected);
    }

    #[rstest]
    fn split_calls_match_single_call(#[values(1, 3, 8, 17, 18, -1, -2, -3)] code: i32) {
        let term = Term::from_code(code).unwrap();
        let residuals: Vec<i32> = (0..40).map(|i| (i * 37 % 23) - 11).collect();

        let mut whole = pass(term, 3, 300);
        let mut expected = residuals.clone();
        whole.decorr_stereo(&mut expected);

        let mut split = pass(term, 3, 300);
        let mut actual = residuals;
        let (head, tail) = actual.split_at_mut(14);
        split.decorr_stereo(head);
        split.decorr_stereo(tail);

        assert_eq!(actual, expected);
        assert_eq!(split, whole);
    }
}
