//! Target rate functions.
//!
//! A [RateFunction] maps the number of seconds since a load test started to a target rate in
//! requests per second. Functions are plain values: cheap to clone, pure, and composable.

use std::{f64::consts::PI, ops, sync::Arc};

use conv::ConvUtil;
use thiserror::Error;

/// A pure function from elapsed seconds to a non-negative target rate (requests/second).
#[derive(Debug, Clone, PartialEq)]
pub struct RateFunction {
    shape: Shape,
}

#[derive(Debug, Clone, PartialEq)]
enum Shape {
    Constant(f64),
    Linear(f64),
    Sinusoid {
        baseline: f64,
        amplitude: f64,
        period: f64,
        phase: f64,
    },
    Piecewise {
        segments: Arc<[Segment]>,
        total: f64,
    },
    Steps {
        values: Arc<[f64]>,
        step: f64,
    },
    Sum(Arc<[RateFunction]>),
    Shifted {
        seconds: f64,
        inner: Box<RateFunction>,
    },
}

/// One piece of a [piecewise](RateFunction::piecewise) function.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    duration: f64,
    function: RateFunction,
}

/// Invalid rate function parameters.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RateFunctionError {
    /// The sinusoid would dip below zero.
    #[error("baseline of {baseline} and amplitude of {amplitude} will produce a negative rate")]
    NegativeSinusoid {
        /// Sinusoid baseline.
        baseline: f64,
        /// Sinusoid amplitude.
        amplitude: f64,
    },
    /// A period, step or ramp which must be strictly positive wasn't.
    #[error("{what} must be positive and finite, got {value}")]
    NonPositive {
        /// The parameter at fault.
        what: &'static str,
        /// The offending value.
        value: f64,
    },
    /// A rate or duration was negative or not finite.
    #[error("{what} must be non-negative and finite, got {value}")]
    Negative {
        /// The parameter at fault.
        what: &'static str,
        /// The offending value.
        value: f64,
    },
    /// No segments or values to build from.
    #[error("{0} needs at least one element")]
    Empty(&'static str),
}

impl RateFunction {
    fn new(shape: Shape) -> Self {
        Self { shape }
    }

    /// Always `value`.
    ///
    /// Unchecked, so it can offset other functions in a sum. The limiter treats negative rates as
    /// zero. Use [try_constant](Self::try_constant) for a rate on its own.
    pub fn constant(value: f64) -> Self {
        Self::new(Shape::Constant(value))
    }

    /// Always `value`, which must be non-negative and finite.
    pub fn try_constant(value: f64) -> Result<Self, RateFunctionError> {
        non_negative("constant rate", value)?;
        Ok(Self::constant(value))
    }

    /// `slope * t`.
    ///
    /// The slope may be negative, e.g. to ramp down within a [piecewise](Self::piecewise)
    /// function.
    pub fn linear(slope: f64) -> Self {
        Self::new(Shape::Linear(slope))
    }

    /// `baseline + amplitude * sin(phase + 2πt / period)`.
    ///
    /// Fails if the curve could go negative, or the period isn't positive.
    pub fn sinusoid(
        baseline: f64,
        amplitude: f64,
        period: f64,
        phase: f64,
    ) -> Result<Self, RateFunctionError> {
        if baseline - amplitude.abs() < 0. {
            return Err(RateFunctionError::NegativeSinusoid {
                baseline,
                amplitude,
            });
        }
        positive("sinusoid period", period)?;

        Ok(Self::new(Shape::Sinusoid {
            baseline,
            amplitude,
            period,
            phase,
        }))
    }

    /// Cycles through `segments`, wrapping around modulo their total duration.
    ///
    /// Each segment's function is evaluated on the time elapsed *within that segment*.
    pub fn piecewise(segments: Vec<Segment>) -> Result<Self, RateFunctionError> {
        if segments.is_empty() {
            return Err(RateFunctionError::Empty("piecewise"));
        }
        for segment in &segments {
            non_negative("segment duration", segment.duration)?;
        }
        let total: f64 = segments.iter().map(|s| s.duration).sum();
        positive("piecewise total duration", total)?;

        Ok(Self::new(Shape::Piecewise {
            segments: segments.into(),
            total,
        }))
    }

    /// A repeating spike on top of a baseline.
    ///
    /// Stays at `baseline` for `low_duration`, ramps linearly up to `baseline + height` over
    /// `ramp`, holds for `high_duration`, ramps back down over `ramp`, then repeats.
    pub fn spike(
        baseline: f64,
        low_duration: f64,
        height: f64,
        high_duration: f64,
        ramp: f64,
    ) -> Result<Self, RateFunctionError> {
        non_negative("spike baseline", baseline)?;
        non_negative("spike height", height)?;
        positive("spike ramp", ramp)?;

        let spike = Self::piecewise(vec![
            Segment::new(low_duration, Self::constant(0.)),
            Segment::new(ramp, Self::linear(height / ramp)),
            Segment::new(high_duration, Self::constant(height)),
            Segment::new(
                ramp,
                Self::linear(-height / ramp) + Self::constant(height),
            ),
        ])?;

        Ok(spike + Self::constant(baseline))
    }

    /// Holds each of `values` for `step_seconds`, cycling back to the start.
    pub fn steps(values: Vec<f64>, step_seconds: f64) -> Result<Self, RateFunctionError> {
        if values.is_empty() {
            return Err(RateFunctionError::Empty("steps"));
        }
        for &value in &values {
            non_negative("step value", value)?;
        }
        positive("step duration", step_seconds)?;

        Ok(Self::new(Shape::Steps {
            values: values.into(),
            step: step_seconds,
        }))
    }

    /// The pointwise sum of `functions`.
    pub fn sum(functions: impl IntoIterator<Item = RateFunction>) -> Self {
        Self::new(Shape::Sum(functions.into_iter().collect()))
    }

    /// Delays the time origin of `function` by `seconds`: `f(t - seconds)`.
    pub fn shift_right(seconds: f64, function: RateFunction) -> Self {
        Self::new(Shape::Shifted {
            seconds,
            inner: Box::new(function),
        })
    }

    /// Evaluate at `seconds` since the start.
    pub fn at(&self, seconds: f64) -> f64 {
        match &self.shape {
            Shape::Constant(value) => *value,
            Shape::Linear(slope) => slope * seconds,
            Shape::Sinusoid {
                baseline,
                amplitude,
                period,
                phase,
            } => baseline + amplitude * (phase + 2. * PI * seconds / period).sin(),
            Shape::Piecewise { segments, total } => {
                let mut remainder = seconds.rem_euclid(*total);
                for segment in segments.iter() {
                    if remainder <= segment.duration {
                        return segment.function.at(remainder);
                    }
                    remainder -= segment.duration;
                }
                // Only reachable through rounding at the very end of the cycle.
                segments
                    .last()
                    .map_or(0., |last| last.function.at(last.duration))
            }
            Shape::Steps { values, step } => {
                let in_pattern = seconds.rem_euclid(step * values.len() as f64);
                let bucket = (in_pattern / step)
                    .floor()
                    .approx_as::<usize>()
                    .unwrap_or(0)
                    .min(values.len() - 1);
                values[bucket]
            }
            Shape::Sum(functions) => functions.iter().map(|f| f.at(seconds)).sum(),
            Shape::Shifted {
                seconds: shift,
                inner,
            } => inner.at(seconds - shift),
        }
    }
}

impl Segment {
    /// Follow `function` for `duration` seconds.
    pub fn new(duration: f64, function: RateFunction) -> Self {
        Self { duration, function }
    }
}

impl ops::Add for RateFunction {
    type Output = RateFunction;

    fn add(self, rhs: Self) -> Self::Output {
        RateFunction::sum([self, rhs])
    }
}

fn positive(what: &'static str, value: f64) -> Result<(), RateFunctionError> {
    if value > 0. && value.is_finite() {
        Ok(())
    } else {
        Err(RateFunctionError::NonPositive { what, value })
    }
}

fn non_negative(what: &'static str, value: f64) -> Result<(), RateFunctionError> {
    if value >= 0. && value.is_finite() {
        Ok(())
    } else {
        Err(RateFunctionError::Negative { what, value })
    }
}
