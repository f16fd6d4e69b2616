use rand::Rng;
use rand_distr::{Distribution as DistR, Exp, Gamma, Normal, Uniform};
use serde::{Deserialize, Serialize};

/// Shape of the inter-send interval around its nominal value.
///
/// `sample` returns the multiplier applied to the nominal interval. Every
/// shape has mean 1.0, so the long-run rate matches the nominal rate.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum TrafficShape {
    Uniform(f64),
    Normal(f64),
    Peaks(f64),
    Gamma(f64),
    Exponential(f64),
}

impl TrafficShape {
    pub fn name(&self) -> &'static str {
        match *self {
            TrafficShape::Uniform(_) => "uniform",
            TrafficShape::Normal(_) => "normal",
            TrafficShape::Peaks(_) => "peaks",
            TrafficShape::Gamma(_) => "gamma",
            TrafficShape::Exponential(_) => "exponential",
        }
    }

    pub fn param(&self) -> f64 {
        match *self {
            TrafficShape::Uniform(p)
            | TrafficShape::Normal(p)
            | TrafficShape::Peaks(p)
            | TrafficShape::Gamma(p)
            | TrafficShape::Exponential(p) => p,
        }
    }

    /// Parameters rejected by `create` degrade to the shape's mean.
    pub fn sample<R: Rng>(&self, rng: &mut R) -> f64 {
        match *self {
            TrafficShape::Uniform(delta) => {
                if delta == 0.0 {
                    return 1.0;
                }
                Uniform::new_inclusive(1.0 - delta, 1.0 + delta).sample(rng)
            }
            TrafficShape::Normal(stddev) => Normal::new(1.0, stddev).map_or(1.0, |d| d.sample(rng)),
            TrafficShape::Peaks(stddev) => {
                let mean = if rng.gen_range(0..10) == 0 {
                    9.0
                } else {
                    1.0 / 9.0
                };
                Normal::new(mean, stddev).map_or(mean, |d| d.sample(rng))
            }
            TrafficShape::Gamma(alpha) => {
                Gamma::new(alpha, 1.0 / alpha).map_or(1.0, |d| d.sample(rng))
            }
            TrafficShape::Exponential(lambda) => {
                Exp::new(lambda).map_or(1.0, |d| lambda * d.sample(rng))
            }
        }
    }

    /// Parses `name:param`, e.g. `uniform:0.1` or `gamma:2`.
    pub fn create(spec: &str) -> Result<Self, String> {
        let tokens: Vec<&str> = spec.split(':').collect();
        if tokens.len() != 2 {
            return Err(format!("bad traffic shape spec: {}", spec));
        }
        let param: f64 = tokens[1]
            .parse()
            .map_err(|e| format!("bad traffic shape parameter {:?}: {}", tokens[1], e))?;
        let shape = match tokens[0] {
            "uniform" => TrafficShape::Uniform(param),
            "normal" => TrafficShape::Normal(param),
            "peaks" => TrafficShape::Peaks(param),
            "gamma" => TrafficShape::Gamma(param),
            "exponential" => TrafficShape::Exponential(param),
            other => return Err(format!("unknown traffic shape: {}", other)),
        };
        shape.validate()?;
        Ok(shape)
    }

    fn validate(&self) -> Result<(), String> {
        let ok = match *self {
            TrafficShape::Uniform(d) => (0.0..=1.0).contains(&d),
            TrafficShape::Normal(s) | TrafficShape::Peaks(s) => s.is_finite() && s >= 0.0,
            TrafficShape::Gamma(p) | TrafficShape::Exponential(p) => p.is_finite() && p > 0.0,
        };
        if ok {
            Ok(())
        } else {
            Err(format!("{} parameter out of range: {}", self.name(), self.param()))
        }
    }
}

impl Default for TrafficShape {
    fn default() -> Self {
        TrafficShape::Uniform(0.1)
    }
}
