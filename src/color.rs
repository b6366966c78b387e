//! Perceptual color distance between filament colors.
//!
//! Colors are compared with CIEDE2000 in CIE Lab space (D65 white point),
//! which tracks how different two colors look to a person far better than
//! a distance over raw RGB channels.

use std::{f64::consts::PI, fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// The default tolerance for treating two colors as interchangeable.
pub const DEFAULT_THRESHOLD: f64 = 5.0;

/// An sRGB color, as written `#RRGGBB`.
///
/// Parsing also accepts a missing `#` and a trailing alpha byte, which is
/// dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Rgb {
    /// Red.
    pub r: u8,
    /// Green.
    pub g: u8,
    /// Blue.
    pub b: u8,
}

impl Rgb {
    /// Build a color from its channels.
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    fn to_lab(self) -> Lab {
        fn linear(channel: u8) -> f64 {
            let n = f64::from(channel) / 255.0;
            if n > 0.04045 {
                ((n + 0.055) / 1.055).powf(2.4)
            } else {
                n / 12.92
            }
        }

        fn pivot(n: f64) -> f64 {
            if n > 0.008856 {
                n.cbrt()
            } else {
                7.787 * n + 16.0 / 116.0
            }
        }

        let (r, g, b) = (linear(self.r), linear(self.g), linear(self.b));

        let x = r * 0.4124564 + g * 0.3575761 + b * 0.1804375;
        let y = r * 0.2126729 + g * 0.7151522 + b * 0.0721750;
        let z = r * 0.0193339 + g * 0.1191920 + b * 0.9503041;

        let fx = pivot(x / 0.95047);
        let fy = pivot(y / 1.00000);
        let fz = pivot(z / 1.08883);

        Lab {
            l: 116.0 * fy - 16.0,
            a: 500.0 * (fx - fy),
            b: 200.0 * (fy - fz),
        }
    }
}

impl FromStr for Rgb {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidColorFormat(s.to_string());

        let hex = s.trim().trim_start_matches('#');
        if !hex.bytes().all(|c| c.is_ascii_hexdigit()) {
            return Err(invalid());
        }
        let hex = match hex.len() {
            6 => hex,
            8 => &hex[..6],
            _ => return Err(invalid()),
        };

        let channel = |i: usize| u8::from_str_radix(&hex[i..i + 2], 16).map_err(|_| invalid());
        Ok(Rgb::new(channel(0)?, channel(2)?, channel(4)?))
    }
}

impl TryFrom<String> for Rgb {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Rgb> for String {
    fn from(value: Rgb) -> Self {
        value.to_string()
    }
}

impl schemars::JsonSchema for Rgb {
    fn schema_name() -> String {
        "Rgb".to_string()
    }

    fn json_schema(gen: &mut schemars::gen::SchemaGenerator) -> schemars::schema::Schema {
        String::json_schema(gen)
    }
}

impl fmt::Display for Rgb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:02X}{:02X}{:02X}", self.r, self.g, self.b)
    }
}

#[derive(Debug, Clone, Copy)]
struct Lab {
    l: f64,
    a: f64,
    b: f64,
}

/// CIEDE2000 distance between two colors. 0 means identical, values under
/// about 1 are imperceptible.
pub fn distance(a: Rgb, b: Rgb) -> f64 {
    if a == b {
        return 0.0;
    }
    ciede2000(a.to_lab(), b.to_lab())
}

/// [`distance`] over two hex strings.
pub fn delta_e(a: &str, b: &str) -> Result<f64> {
    Ok(distance(a.parse()?, b.parse()?))
}

/// Whether `candidate` is close enough to `target` to stand in for it.
pub fn is_match(target: Rgb, candidate: Rgb, threshold: f64) -> bool {
    distance(target, candidate) <= threshold
}

fn ciede2000(lab1: Lab, lab2: Lab) -> f64 {
    const POW25_7: f64 = 6_103_515_625.0;

    let Lab { l: l1, a: a1, b: b1 } = lab1;
    let Lab { l: l2, a: a2, b: b2 } = lab2;

    let avg_lp = (l1 + l2) / 2.0;
    let c1 = a1.hypot(b1);
    let c2 = a2.hypot(b2);
    let avg_c = (c1 + c2) / 2.0;

    let g = 0.5 * (1.0 - (avg_c.powi(7) / (avg_c.powi(7) + POW25_7)).sqrt());

    let a1p = (1.0 + g) * a1;
    let a2p = (1.0 + g) * a2;

    let c1p = a1p.hypot(b1);
    let c2p = a2p.hypot(b2);
    let avg_cp = (c1p + c2p) / 2.0;

    let hue = |a: f64, b: f64| {
        let h = b.atan2(a);
        if h < 0.0 {
            h + 2.0 * PI
        } else {
            h
        }
    };
    let h1p = hue(a1p, b1);
    let h2p = hue(a2p, b2);

    let avg_hp = if (h1p - h2p).abs() > PI {
        if h1p + h2p < 2.0 * PI {
            (h1p + h2p + 2.0 * PI) / 2.0
        } else {
            (h1p + h2p - 2.0 * PI) / 2.0
        }
    } else {
        (h1p + h2p) / 2.0
    };

    let t = 1.0 - 0.17 * (avg_hp - 30f64.to_radians()).cos()
        + 0.24 * (2.0 * avg_hp).cos()
        + 0.32 * (3.0 * avg_hp + 6f64.to_radians()).cos()
        - 0.20 * (4.0 * avg_hp - 63f64.to_radians()).cos();

    let mut delta_hp = h2p - h1p;
    if delta_hp.abs() > PI {
        if h2p <= h1p {
            delta_hp += 2.0 * PI;
        } else {
            delta_hp -= 2.0 * PI;
        }
    }

    let delta_lp = l2 - l1;
    let delta_cp = c2p - c1p;
    let delta_big_hp = 2.0 * (c1p * c2p).sqrt() * (delta_hp / 2.0).sin();

    let sl = 1.0 + (0.015 * (avg_lp - 50.0).powi(2)) / (20.0 + (avg_lp - 50.0).powi(2)).sqrt();
    let sc = 1.0 + 0.045 * avg_cp;
    let sh = 1.0 + 0.015 * avg_cp * t;

    let delta_ro = 30f64.to_radians() * (-((avg_hp.to_degrees() - 275.0) / 25.0).powi(2)).exp();
    let rc = 2.0 * (avg_cp.powi(7) / (avg_cp.powi(7) + POW25_7)).sqrt();
    let rt = -(2.0 * delta_ro).sin() * rc;

    let dl = delta_lp / sl;
    let dc = delta_cp / sc;
    let dh = delta_big_hp / sh;

    (dl * dl + dc * dc + dh * dh + rt * dc * dh).max(0.0).sqrt()
}
