//! Governors: pure mappings from an eco-signal to an actuator setpoint.
//!
//! A governor is parsed from the config grammar
//! `name[:arg[:arg…]]` where each arg is `key=value` or a bare token.
//! Values use the grammar `min`, `max`, absolute-with-unit (`950mhz`,
//! `35w`), percentage (`60%`), or a raw fraction (`0.6`) of the enclosing
//! policy's maximum. Output is always clamped into the policy's
//! `[vmin, vmax]` range at construction time.

use crate::error::{EcoError, Result};
use crate::record::Signal;

/// Unit suffix accepted by the value grammar, with its factor into the
/// policy's base unit (e.g. `mhz` → 1e3 for a kHz-based actuator).
#[derive(Debug, Clone, Copy)]
pub struct Unit {
    pub name: &'static str,
    pub factor: f64,
}

/// Signal-to-setpoint mapping.
#[derive(Debug, Clone, PartialEq)]
pub enum Governor {
    /// Fixed setpoint, independent of the signal.
    Constant { val: f64 },
    /// Linear interpolation: `v_at_low` at/below `x_low`, `v_at_high`
    /// at/above `x_high` (higher signal → lower setpoint).
    Linear {
        x_low: f64,
        x_high: f64,
        v_at_low: f64,
        v_at_high: f64,
    },
    /// Highest threshold ≤ signal wins; `vmax` when none matches.
    Step { steps: Vec<(f64, f64)>, vmax: f64 },
    /// Discrete tag match; `vmax` when no tag matches.
    List { steps: Vec<(String, f64)>, vmax: f64 },
}

/// Parse one value token against the policy range.
pub fn parse_val(vstr: &str, vmin: f64, vmax: f64, units: &[Unit]) -> Result<f64> {
    let s = vstr.trim().to_ascii_lowercase();
    let val = if s == "min" {
        vmin
    } else if s == "max" {
        vmax
    } else {
        let mut abs = None;
        for u in units {
            if let Some(num) = s.strip_suffix(u.name) {
                let num: f64 = num.parse().map_err(|_| {
                    EcoError::Config(format!("bad governor value: {}", vstr))
                })?;
                abs = Some(num * u.factor);
                break;
            }
        }
        match abs {
            Some(v) => v,
            None => {
                let p = if let Some(pct) = s.strip_suffix('%') {
                    pct.parse::<f64>().map_err(|_| {
                        EcoError::Config(format!("bad governor value: {}", vstr))
                    })? / 100.0
                } else {
                    s.parse::<f64>()
                        .map_err(|_| EcoError::Config(format!("bad governor value: {}", vstr)))?
                };
                vmax * p
            }
        }
    };
    if val > vmax || val < vmin {
        return Err(EcoError::Config(format!(
            "governor parameter out of bounds: {} (range {} - {})",
            vstr, vmin, vmax
        )));
    }
    Ok(val)
}

fn split_args(toks: &[&str]) -> Vec<(String, Option<String>)> {
    toks.iter()
        .map(|t| match t.split_once('=') {
            Some((k, v)) => (k.trim().to_string(), Some(v.trim().to_string())),
            None => (t.trim().to_string(), None),
        })
        .collect()
}

fn round_val(val: f64) -> i64 {
    // keep three decimals before the final integer cast, as the report
    // values do
    let v = (val * 1000.0).round() / 1000.0;
    v.round() as i64
}

impl Governor {
    /// Parse a governor spec string. `none`/`off` yields `None` (policy
    /// installed but inert); `default_spec` resolves the `default` alias.
    pub fn parse(
        spec: &str,
        default_spec: Option<&str>,
        vmin: f64,
        vmax: f64,
        units: &[Unit],
    ) -> Result<Option<Governor>> {
        let mut spec = spec.trim().to_ascii_lowercase();
        if spec == "default" {
            spec = default_spec
                .ok_or_else(|| EcoError::Config("governor 'default' without DefaultGovernor".into()))?
                .trim()
                .to_ascii_lowercase();
        }
        let toks: Vec<&str> = spec.split(':').collect();
        let name = toks[0];
        let args = split_args(&toks[1..]);
        match name {
            "linear" | "lineargovernor" => {
                Ok(Some(Self::parse_linear(&args, vmin, vmax, units)?))
            }
            "step" => Ok(Some(Self::parse_step(&args, vmin, vmax, units)?)),
            "list" => Ok(Some(Self::parse_list(&args, vmin, vmax, units)?)),
            "const" => {
                let val = match args.first() {
                    Some((k, None)) => parse_val(k, vmin, vmax, units)?,
                    Some((k, Some(_))) => {
                        return Err(EcoError::Config(format!(
                            "const governor takes a single value, got {}=",
                            k
                        )))
                    }
                    None => vmax,
                };
                Ok(Some(Governor::Constant { val }))
            }
            "maxperf" => Ok(Some(Governor::Constant { val: vmax })),
            _ if crate::is_disabled(name) => Ok(None),
            other => Err(EcoError::Config(format!("unknown governor: {}", other))),
        }
    }

    fn parse_linear(
        args: &[(String, Option<String>)],
        vmin: f64,
        vmax: f64,
        units: &[Unit],
    ) -> Result<Governor> {
        if args.is_empty() {
            // bare `linear` maps the conventional carbon-intensity band
            return Ok(Governor::Linear {
                x_low: 100.0,
                x_high: 800.0,
                v_at_low: vmax,
                v_at_high: vmin,
            });
        }
        if args.len() != 2 {
            return Err(EcoError::Config(
                "linear governor needs exactly two <signal>=<value> points".into(),
            ));
        }
        let mut points = Vec::new();
        for (k, v) in args {
            let x: f64 = k
                .parse()
                .map_err(|_| EcoError::Config(format!("bad linear threshold: {}", k)))?;
            points.push((x, v.clone()));
        }
        points.sort_by(|a, b| a.0.total_cmp(&b.0));
        let (x_low, ref v_low_str) = points[0];
        let (x_high, ref v_high_str) = points[1];
        let v_at_low = match v_low_str {
            Some(s) => parse_val(s, vmin, vmax, units)?,
            None => vmax,
        };
        let v_at_high = match v_high_str {
            Some(s) => parse_val(s, vmin, vmax, units)?,
            None => vmin,
        };
        Ok(Governor::Linear {
            x_low,
            x_high,
            v_at_low,
            v_at_high,
        })
    }

    fn parse_step(
        args: &[(String, Option<String>)],
        vmin: f64,
        vmax: f64,
        units: &[Unit],
    ) -> Result<Governor> {
        let mut steps = Vec::new();
        for (k, v) in args {
            let x: f64 = k
                .parse()
                .map_err(|_| EcoError::Config(format!("bad step threshold: {}", k)))?;
            let vstr = v
                .as_deref()
                .ok_or_else(|| EcoError::Config(format!("step {} is missing a value", k)))?;
            steps.push((x, parse_val(vstr, vmin, vmax, units)?));
        }
        // first threshold <= signal wins, so scan highest-first
        steps.sort_by(|a, b| b.0.total_cmp(&a.0));
        Ok(Governor::Step { steps, vmax })
    }

    fn parse_list(
        args: &[(String, Option<String>)],
        vmin: f64,
        vmax: f64,
        units: &[Unit],
    ) -> Result<Governor> {
        let mut steps = Vec::new();
        for (k, v) in args {
            let vstr = v
                .as_deref()
                .ok_or_else(|| EcoError::Config(format!("list tag {} is missing a value", k)))?;
            steps.push((k.clone(), parse_val(vstr, vmin, vmax, units)?));
        }
        Ok(Governor::List { steps, vmax })
    }

    /// Map a signal to an actuator setpoint. `None` when the signal shape
    /// does not fit the governor (e.g. a tag fed to a numeric governor).
    pub fn value(&self, signal: &Signal) -> Option<i64> {
        match self {
            Governor::Constant { val } => Some(round_val(*val)),
            Governor::Linear {
                x_low,
                x_high,
                v_at_low,
                v_at_high,
            } => {
                let x = signal.as_num()?;
                let k = if x >= *x_high {
                    0.0
                } else if x <= *x_low {
                    1.0
                } else {
                    1.0 - (x - x_low) / (x_high - x_low)
                };
                Some(round_val(v_at_high + (v_at_low - v_at_high) * k))
            }
            Governor::Step { steps, vmax } => {
                let x = signal.as_num()?;
                let val = steps
                    .iter()
                    .find(|(s, _)| x >= *s)
                    .map(|(_, v)| *v)
                    .unwrap_or(*vmax);
                Some(round_val(val))
            }
            Governor::List { steps, vmax } => {
                let tag = signal.to_string();
                let val = steps
                    .iter()
                    .find(|(s, _)| *s == tag)
                    .map(|(_, v)| *v)
                    .unwrap_or(*vmax);
                Some(round_val(val))
            }
        }
    }

    /// Config-grammar rendition with values scaled back into `unit`.
    pub fn info_string(&self, unit: &Unit) -> String {
        let v = |val: f64| {
            let scaled = val / unit.factor;
            if scaled.fract() == 0.0 {
                format!("{}{}", scaled as i64, unit.name)
            } else {
                format!("{:.3}{}", scaled, unit.name)
            }
        };
        match self {
            Governor::Constant { val } => format!("const:{}", v(*val)),
            Governor::Linear {
                x_low,
                x_high,
                v_at_low,
                v_at_high,
            } => format!("linear:{}={}:{}={}", x_low, v(*v_at_low), x_high, v(*v_at_high)),
            Governor::Step { steps, .. } => {
                let mut parts = vec!["step".to_string()];
                for (s, val) in steps.iter().rev() {
                    parts.push(format!("{}={}", s, v(*val)));
                }
                parts.join(":")
            }
            Governor::List { steps, .. } => {
                let mut parts = vec!["list".to_string()];
                for (s, val) in steps {
                    parts.push(format!("{}={}", s, v(*val)));
                }
                parts.join(":")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MHZ: Unit = Unit { name: "mhz", factor: 1e3 };
    const GHZ: Unit = Unit { name: "ghz", factor: 1e6 };
    const WATT: Unit = Unit { name: "w", factor: 1.0 };
    const FREQ_UNITS: &[Unit] = &[MHZ, GHZ];

    fn num(x: f64) -> Signal {
        Signal::Num(x)
    }

    #[test]
    fn test_value_grammar() {
        assert_eq!(parse_val("min", 800.0, 4000.0, &[MHZ]).unwrap(), 800.0);
        assert_eq!(parse_val("max", 800.0, 4000.0, &[MHZ]).unwrap(), 4000.0);
        assert_eq!(parse_val("35w", 10.0, 125.0, &[WATT]).unwrap(), 35.0);
        assert_eq!(
            parse_val("950mhz", 800_000.0, 4_000_000.0, FREQ_UNITS).unwrap(),
            950_000.0
        );
        assert_eq!(
            parse_val("1.5ghz", 800_000.0, 4_000_000.0, FREQ_UNITS).unwrap(),
            1_500_000.0
        );
        assert_eq!(parse_val("60%", 0.0, 200.0, &[WATT]).unwrap(), 120.0);
        assert_eq!(parse_val("0.6", 0.0, 200.0, &[WATT]).unwrap(), 120.0);
    }

    #[test]
    fn test_out_of_range_constant_fails() {
        assert!(parse_val("500mhz", 800_000.0, 4_000_000.0, FREQ_UNITS).is_err());
        assert!(parse_val("150%", 0.0, 200.0, &[WATT]).is_err());
        assert!(Governor::parse("const:9000mhz", None, 800_000.0, 4_000_000.0, FREQ_UNITS).is_err());
    }

    #[test]
    fn test_linear_scenario_mhz() {
        // linear over 100..800 gCO2/kWh mapping 4000 MHz down to 800 MHz
        let gov = Governor::parse(
            "linear:100=4000mhz:800=800mhz",
            None,
            800_000.0,
            4_000_000.0,
            FREQ_UNITS,
        )
        .unwrap()
        .unwrap();
        assert_eq!(gov.value(&num(100.0)), Some(4_000_000));
        assert_eq!(gov.value(&num(450.0)), Some(2_400_000));
        assert_eq!(gov.value(&num(800.0)), Some(800_000));
        assert_eq!(gov.value(&num(1000.0)), Some(800_000));
        assert_eq!(gov.value(&num(50.0)), Some(4_000_000));
    }

    #[test]
    fn test_linear_defaults_to_full_range() {
        let gov = Governor::parse("linear:100:800", None, 800_000.0, 4_000_000.0, FREQ_UNITS)
            .unwrap()
            .unwrap();
        assert_eq!(gov.value(&num(0.0)), Some(4_000_000));
        assert_eq!(gov.value(&num(900.0)), Some(800_000));
    }

    #[test]
    fn test_linear_clamped_into_range() {
        let gov = Governor::parse(
            "linear:100=4000mhz:800=800mhz",
            None,
            800_000.0,
            4_000_000.0,
            FREQ_UNITS,
        )
        .unwrap()
        .unwrap();
        for x in [-50.0, 0.0, 100.0, 300.0, 450.0, 799.0, 800.0, 5000.0] {
            let v = gov.value(&num(x)).unwrap();
            assert!((800_000..=4_000_000).contains(&v), "out of range at {}", x);
        }
    }

    #[test]
    fn test_step_scenario() {
        // thresholds 500 -> 1.5 GHz, 200 -> 2.5 GHz, vmax 3.5 GHz
        let gov = Governor::parse(
            "step:500=1.5ghz:200=2.5ghz",
            None,
            800_000.0,
            3_500_000.0,
            FREQ_UNITS,
        )
        .unwrap()
        .unwrap();
        assert_eq!(gov.value(&num(100.0)), Some(3_500_000));
        assert_eq!(gov.value(&num(300.0)), Some(2_500_000));
        assert_eq!(gov.value(&num(600.0)), Some(1_500_000));
        // boundary: threshold <= signal selects the step
        assert_eq!(gov.value(&num(200.0)), Some(2_500_000));
        assert_eq!(gov.value(&num(500.0)), Some(1_500_000));
    }

    #[test]
    fn test_list_tags() {
        let gov = Governor::parse("list:red=min:green=max", None, 10.0, 100.0, &[WATT])
            .unwrap()
            .unwrap();
        assert_eq!(gov.value(&Signal::Tag("red".into())), Some(10));
        assert_eq!(gov.value(&Signal::Tag("green".into())), Some(100));
        // unmatched tag falls back to vmax
        assert_eq!(gov.value(&Signal::Tag("purple".into())), Some(100));
        // integer index levels match their decimal rendition
        let gov = Governor::parse("list:3=min:1=max", None, 10.0, 100.0, &[WATT])
            .unwrap()
            .unwrap();
        assert_eq!(gov.value(&num(3.0)), Some(10));
    }

    #[test]
    fn test_constant_and_aliases() {
        let gov = Governor::parse("const:50%", None, 0.0, 200.0, &[WATT]).unwrap().unwrap();
        assert_eq!(gov.value(&num(123.0)), Some(100));
        let gov = Governor::parse("maxperf", None, 0.0, 200.0, &[WATT]).unwrap().unwrap();
        assert_eq!(gov.value(&num(999.0)), Some(200));
        let gov = Governor::parse("default", Some("const:min"), 40.0, 200.0, &[WATT])
            .unwrap()
            .unwrap();
        assert_eq!(gov.value(&num(0.0)), Some(40));
    }

    #[test]
    fn test_disabled_and_unknown() {
        assert!(Governor::parse("none", None, 0.0, 1.0, &[]).unwrap().is_none());
        assert!(Governor::parse("off", None, 0.0, 1.0, &[]).unwrap().is_none());
        assert!(Governor::parse("quadratic", None, 0.0, 1.0, &[]).is_err());
    }

    #[test]
    fn test_tag_fed_to_numeric_governor() {
        let gov = Governor::parse("linear:100:800", None, 0.0, 100.0, &[WATT])
            .unwrap()
            .unwrap();
        assert_eq!(gov.value(&Signal::Tag("green".into())), None);
        // numeric-looking tags still work
        assert_eq!(gov.value(&Signal::Tag("900".into())), Some(0));
    }

    #[test]
    fn test_info_string_roundtrips_grammar() {
        let spec = "linear:100=4000mhz:800=800mhz";
        let gov = Governor::parse(spec, None, 800_000.0, 4_000_000.0, FREQ_UNITS)
            .unwrap()
            .unwrap();
        assert_eq!(gov.info_string(&MHZ), spec);
        let spec = "step:200=2500mhz:500=1500mhz";
        let gov = Governor::parse(spec, None, 800_000.0, 3_500_000.0, FREQ_UNITS)
            .unwrap()
            .unwrap();
        assert_eq!(gov.info_string(&MHZ), spec);
    }
}
