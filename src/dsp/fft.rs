// Copyright (C) 2026 Michael Wilson <mike@mdwn.dev>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//
// In-place radix-2 transform over interleaved I/Q floats, plus the
// correlation helpers built on it. The forward pass normalizes by 1/n and
// the inverse does not, so correlation magnitudes stay comparable across
// invocations regardless of the window size.
//

/// Largest power of two less than or equal to `n`.
pub fn floor_pow2(n: usize) -> usize {
    let mut m = 0;
    let mut n = n;
    loop {
        n /= 2;
        if n == 0 {
            break;
        }
        m += 1;
    }
    1 << m
}

/// In-place Cooley–Tukey transform of `points` complex values held as
/// interleaved floats in `iq`. `points` is rounded down to a power of two;
/// anything beyond that region is left untouched.
pub fn transform(iq: &mut [f32], points: usize, inverse: bool) {
    let mut m = 0usize;
    let mut size = points;
    loop {
        size /= 2;
        if size == 0 {
            break;
        }
        m += 1;
    }

    let nn = 1usize << m;
    debug_assert!(iq.len() >= nn * 2);

    // Bit-reversal permutation.
    let i2 = nn >> 1;
    let mut j = 0usize;
    for i in 0..nn.saturating_sub(1) {
        if i < j {
            iq.swap(i << 1, j << 1);
            iq.swap((i << 1) + 1, (j << 1) + 1);
        }
        let mut k = i2;
        while k != 0 && k <= j {
            j -= k;
            k >>= 1;
        }
        j += k;
    }

    // Danielson–Lanczos butterflies with the trigonometric recurrence run in
    // double precision so the twiddles stay accurate at long lengths.
    let mut c1 = -1.0f64;
    let mut c2 = 0.0f64;
    let mut l2 = 1usize;
    for _ in 0..m {
        let l1 = l2;
        l2 <<= 1;
        let mut u1 = 1.0f64;
        let mut u2 = 0.0f64;
        for j in 0..l1 {
            let mut i = j;
            while i < nn {
                let ii = i << 1;
                let qi = ii + 1;
                let i1 = i + l1;
                let ii1 = i1 << 1;
                let qi1 = ii1 + 1;

                let t1 = u1 * iq[ii1] as f64 - u2 * iq[qi1] as f64;
                let t2 = u1 * iq[qi1] as f64 + u2 * iq[ii1] as f64;
                iq[ii1] = iq[ii] - t1 as f32;
                iq[qi1] = iq[qi] - t2 as f32;
                iq[ii] += t1 as f32;
                iq[qi] += t2 as f32;

                i += l2;
            }
            let z = u1 * c1 - u2 * c2;
            u2 = u1 * c2 + u2 * c1;
            u1 = z;
        }
        c2 = ((1.0 - c1) / 2.0).sqrt();
        if !inverse {
            c2 = -c2;
        }
        c1 = ((1.0 + c1) / 2.0).sqrt();
    }

    if !inverse {
        let scale = 1.0 / nn as f32;
        for value in iq[..nn * 2].iter_mut() {
            *value *= scale;
        }
    }
}

/// Spreads `input` into `out` as complex values with zero imaginary parts.
/// `out` must hold `2 × input.len()` floats.
pub fn real_to_complex(out: &mut [f32], input: &[f32]) {
    for (pair, value) in out.chunks_exact_mut(2).zip(input.iter()) {
        pair[0] = *value;
        pair[1] = 0.0;
    }
}

/// Replaces each complex value with its magnitude, zeroing the imaginary
/// part.
pub fn complex_to_absolute(iq: &mut [f32]) {
    for pair in iq.chunks_exact_mut(2) {
        let i = pair[0];
        let q = pair[1];
        pair[0] = (i * i + q * q).sqrt();
        pair[1] = 0.0;
    }
}

/// Auto-correlation of a real sequence via the Wiener–Khinchin theorem:
/// forward transform, magnitude per bin, inverse transform. `out` must hold
/// `2 × input.len()` floats; the result is real-valued in the even slots.
pub fn autocorrelation(out: &mut [f32], input: &[f32]) {
    let size = input.len();
    real_to_complex(out, input);

    let fft_size = floor_pow2(size);
    transform(out, fft_size, false);
    complex_to_absolute(&mut out[..size * 2]);
    transform(out, fft_size, true);
}

/// Cross-correlation of two complex sequences: both are transformed forward,
/// `a` is replaced with `a · conj(b)`, and the product is transformed back.
/// The result lands in `a`; `b` is left in the frequency domain.
pub fn cross_correlation(a: &mut [f32], b: &mut [f32], samples: usize) {
    let fft_size = floor_pow2(samples);
    let fft_len = fft_size * 2;

    transform(a, fft_size, false);
    transform(b, fft_size, false);

    for (pa, pb) in a[..fft_len].chunks_exact_mut(2).zip(b[..fft_len].chunks_exact(2)) {
        let ai = pa[0];
        let aq = pa[1];
        let bi = pb[0];
        let bq = pb[1];
        pa[0] = ai * bi + aq * bq;
        pa[1] = ai * bq - aq * bi;
    }

    transform(a, fft_size, true);
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_floor_pow2() {
        assert_eq!(1, floor_pow2(1));
        assert_eq!(2, floor_pow2(2));
        assert_eq!(2, floor_pow2(3));
        assert_eq!(4, floor_pow2(4));
        assert_eq!(4, floor_pow2(7));
        assert_eq!(1024, floor_pow2(2047));
        assert_eq!(65536, floor_pow2(65536));
    }

    #[test]
    fn test_round_trip_recovers_input() {
        for points in [2usize, 16, 256, 4096, 65536] {
            let mut iq: Vec<f32> = Vec::with_capacity(points * 2);
            // A deterministic, non-degenerate waveform.
            for k in 0..points {
                let phase = k as f32 * 0.137;
                iq.push(phase.sin() + 0.25);
                iq.push((phase * 1.7).cos());
            }
            let original = iq.clone();

            transform(&mut iq, points, false);
            transform(&mut iq, points, true);

            let mut max_err = 0.0f32;
            let mut max_mag = 0.0f32;
            for (got, want) in iq.iter().zip(original.iter()) {
                max_err = max_err.max((got - want).abs());
                max_mag = max_mag.max(want.abs());
            }
            assert!(
                max_err / max_mag < 1e-4,
                "round trip error {} too large for {} points",
                max_err / max_mag,
                points
            );
        }
    }

    #[test]
    fn test_autocorrelation_peaks_at_period() {
        const PERIOD: usize = 32;
        const SIZE: usize = 1024;

        let input: Vec<f32> = (0..SIZE)
            .map(|i| (2.0 * std::f32::consts::PI * i as f32 / PERIOD as f32).sin())
            .collect();
        let mut out = vec![0.0f32; SIZE * 2];
        autocorrelation(&mut out, &input);

        // The first local maximum of the (signed) correlation after the
        // zero-lag peak falls on the period.
        let real = |lag: usize| out[lag * 2];
        let mut best_lag = PERIOD / 2 + 1;
        for lag in best_lag..PERIOD * 3 / 2 {
            if real(lag) > real(best_lag) {
                best_lag = lag;
            }
        }
        assert!(
            (best_lag as i64 - PERIOD as i64).abs() <= 1,
            "expected peak near {}, got {}",
            PERIOD,
            best_lag
        );
    }

    #[test]
    fn test_cross_correlation_finds_shift() {
        const SIZE: usize = 256;
        const SHIFT: usize = 19;

        // A one-hot impulse against a copy delayed by SHIFT: the correlation
        // argmax lands on the delay counted from the far end (circular lag).
        let mut a = vec![0.0f32; SIZE * 2];
        let mut b = vec![0.0f32; SIZE * 2];
        a[0] = 1.0;
        b[SHIFT * 2] = 1.0;

        cross_correlation(&mut a, &mut b, SIZE);

        let mut best = 0usize;
        let mut best_val = 0.0f32;
        for lag in 0..SIZE {
            let i = a[lag * 2];
            let q = a[lag * 2 + 1];
            let val = (i * i + q * q).sqrt();
            if val > best_val {
                best_val = val;
                best = lag;
            }
        }
        assert_eq!(SIZE - SHIFT, best);
    }
}
