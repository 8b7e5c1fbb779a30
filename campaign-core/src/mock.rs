//! Deterministic mock simulations for smoke testing without an external
//! program.

use crate::error::Result;
use crate::row::Row;
use crate::var::Var;
use crate::worker::Execution;
use crate::Float;

/// Shifted two dimensional Rosenbrock function.
pub fn rosenbrock_value(r: Float, u: Float, v: Float, a: Float, b: Float) -> Float {
    let x = (r - 0.5) + u - 5.;
    let y = 1. + 3. * (v - 0.6);
    (a - x).powi(2) + b * (y - x * x).powi(2)
}

fn input_or(input: &Row, name: &str, default: Float) -> Result<Float> {
    match input.get(name) {
        Some(_) => input.get_float(name),
        None => Ok(default),
    }
}

/// Mock simulation reading `r`, `u`, `v`, `a` and `b` from the input row,
/// falling back to `0.25, 0.5, 0.5, 1, 3` for the missing ones, and writing
/// the result to output `f` if present.
pub fn rosenbrock() -> Execution {
    Execution::function(|input, output| {
        let f = rosenbrock_value(
            input_or(input, "r", 0.25)?,
            input_or(input, "u", 0.5)?,
            input_or(input, "v", 0.5)?,
            input_or(input, "a", 1.)?,
            input_or(input, "b", 3.)?,
        );
        if output.get("f").is_some() {
            output.set("f", Var::Float(f))?;
        }
        Ok(())
    })
}

/// Mock simulation writing the sum of all numeric inputs to every output.
pub fn sum() -> Execution {
    Execution::function(|input, output| {
        let total: Float = input.values().iter().filter_map(|v| v.as_float()).sum();
        for n in 0..output.values().len() {
            output.set_at(n, Var::Float(total))?;
        }
        Ok(())
    })
}

#[test]
fn rosenbrock_minimum() {
    // x = 1, y = 1 at the minimum
    assert_eq!(rosenbrock_value(0.5, 6., 0.6, 1., 3.), 0.);
    assert!((rosenbrock_value(0.25, 0.5, 0.5, 1., 3.) - 1466.96921875).abs() < 1e-6);
}
