//! PT100 resistance to temperature conversion.

use log::warn;

// Callendar-Van Dusen coefficients, IEC 60751.
const CVD_A: f64 = 3.9083e-3;
const CVD_B: f64 = -5.775e-7;
const KELVIN_OFFSET: f64 = 273.15;

// Span the quadratic inverse is trusted over. Readings outside still
// convert, with a warning.
const VALID_LO_K: f64 = 73.15;
const VALID_HI_K: f64 = 1123.15;

/// Platinum RTD with nominal resistance `r0` at 0 degC.
#[derive(Clone, Copy, Debug)]
pub struct Pt100 {
    pub r0: f64,
}

impl Default for Pt100 {
    fn default() -> Self {
        Self { r0: 100.0 }
    }
}

impl Pt100 {
    /// Resistance in ohm to temperature in kelvin, by inverting
    /// `R(T) = R0 (1 + A T + B T^2)`. Returns `None` for readings the
    /// quadratic cannot invert (non-finite, or past the parabola vertex).
    pub fn temperature_k(&self, r_ohm: f64) -> Option<f64> {
        if !r_ohm.is_finite() || self.r0 <= 0.0 {
            return None;
        }
        let ratio = r_ohm / self.r0;
        let disc = CVD_A * CVD_A - 4.0 * CVD_B * (1.0 - ratio);
        if disc < 0.0 {
            return None;
        }
        let t_k = (-CVD_A + disc.sqrt()) / (2.0 * CVD_B) + KELVIN_OFFSET;
        if !(VALID_LO_K..=VALID_HI_K).contains(&t_k) {
            warn!("pt100 reading {r_ohm:.2} ohm maps to {t_k:.1} K, outside the calibrated span");
        }
        Some(t_k)
    }

    /// Forward direction, for simulated sensors.
    pub fn resistance_ohm(&self, t_k: f64) -> f64 {
        let t_c = t_k - KELVIN_OFFSET;
        self.r0 * (1.0 + CVD_A * t_c + CVD_B * t_c * t_c)
    }
}
