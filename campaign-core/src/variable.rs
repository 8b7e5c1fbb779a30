//! Variable declarations and input sampling.
//!
//! Variables are declared by name in the configuration, either with a
//! short string form such as `Uniform(4.7, 5.3)`, a bare number (taken to
//! be a constant) or a table with `kind`, `range` and `dtype` entries.
//! Inputs are sampled from their declared distribution, outputs are filled
//! in by the runs, and independent variables describe the axis of vector
//! valued outputs.

use std::sync::Arc;

use linked_hash_map::LinkedHashMap;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

use crate::error::{Error, Result};
use crate::row::{Field, Row, Schema};
use crate::var::{Var, VarType};
use crate::{Float, VarName};

/// Variable declaration as written in the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VariableEntry {
    Str(String),
    Float(Float),
    Table(VariableTable),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VariableTable {
    pub kind: String,
    #[serde(default)]
    pub range: Option<VariableRange>,
    #[serde(default)]
    pub dtype: Option<String>,
}

/// Either the numeric arguments of a distribution or, for outputs, the
/// name of the independent variable they depend on.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VariableRange {
    Args(Vec<Float>),
    Dependency(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum VariableKind {
    Uniform(Float, Float),
    LogUniform(Float, Float),
    Normal(Float, Float),
    Linear(Float, Float),
    Constant(Float),
    ActiveLearning(Float, Float),
    Independent(Float, Float, Float),
    Output(Option<VarName>),
}

impl VariableKind {
    /// Parses the short string form, e.g. `Normal(0, 1)` or `Output(t)`.
    pub fn from_str(s: &str) -> Result<VariableKind> {
        let s = s.trim();
        let (name, args) = match s.find('(') {
            Some(open) => {
                if !s.ends_with(')') {
                    return Err(Error::ParsingError(format!(
                        "unbalanced parenthesis in variable declaration: {}",
                        s
                    )));
                }
                (&s[..open], &s[open + 1..s.len() - 1])
            }
            None => (s, ""),
        };
        let args: Vec<&str> = args
            .split(',')
            .map(|a| a.trim())
            .filter(|a| !a.is_empty())
            .collect();

        if name.trim().eq_ignore_ascii_case("output") {
            return match args.as_slice() {
                [] => Ok(VariableKind::Output(None)),
                [dep] => Ok(VariableKind::Output(Some(dep.to_string()))),
                _ => Err(Error::ParsingError(format!(
                    "output takes at most one dependency: {}",
                    s
                ))),
            };
        }

        let mut nums = Vec::with_capacity(args.len());
        for arg in args {
            nums.push(arg.parse::<Float>()?);
        }
        VariableKind::from_name_and_range(name.trim(), &nums)
    }

    pub fn from_name_and_range(name: &str, range: &[Float]) -> Result<VariableKind> {
        let arg = |n: usize, default: Float| range.get(n).copied().unwrap_or(default);
        let kind = match name.to_lowercase().replace('_', "").as_str() {
            "uniform" => VariableKind::Uniform(arg(0, 0.), arg(1, 1.)),
            "loguniform" => VariableKind::LogUniform(arg(0, 1e-6), arg(1, 1.)),
            "normal" => VariableKind::Normal(arg(0, 0.), arg(1, 1.)),
            "linear" => VariableKind::Linear(arg(0, 0.), arg(1, 1.)),
            "constant" => VariableKind::Constant(arg(0, 0.)),
            "activelearning" => VariableKind::ActiveLearning(arg(0, 0.), arg(1, 1.)),
            "independent" => VariableKind::Independent(arg(0, 0.), arg(1, 1.), arg(2, 1.)),
            "output" => VariableKind::Output(None),
            _ => return Err(Error::UnknownVariableKind(name.to_string())),
        };
        Ok(kind)
    }
}

/// Fully described variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    pub name: VarName,
    pub kind: VariableKind,
    pub dtype: VarType,
}

impl Variable {
    pub fn from_entry(name: &str, entry: &VariableEntry) -> Result<Variable> {
        let (kind, dtype) = match entry {
            VariableEntry::Float(c) => (VariableKind::Constant(*c), None),
            VariableEntry::Str(s) => (VariableKind::from_str(s)?, None),
            VariableEntry::Table(table) => {
                let kind = match &table.range {
                    Some(VariableRange::Args(args)) => {
                        VariableKind::from_name_and_range(&table.kind, args)?
                    }
                    None => VariableKind::from_name_and_range(&table.kind, &[])?,
                    Some(VariableRange::Dependency(dep)) => {
                        match VariableKind::from_name_and_range(&table.kind, &[])? {
                            VariableKind::Output(_) => VariableKind::Output(Some(dep.clone())),
                            _ => {
                                return Err(Error::InvalidConfiguration(format!(
                                    "variable {}: only outputs take a dependency as range",
                                    name
                                )))
                            }
                        }
                    }
                };
                let dtype = match &table.dtype {
                    Some(d) => Some(VarType::from_str(d)?),
                    None => None,
                };
                (kind, dtype)
            }
        };
        let dtype = match (dtype, &kind) {
            (Some(d), _) => d,
            (None, VariableKind::Output(Some(_))) => VarType::FloatList,
            (None, _) => VarType::Float,
        };
        let variable = Variable {
            name: name.to_string(),
            kind,
            dtype,
        };
        variable.validate()?;
        Ok(variable)
    }

    fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| {
            Err(Error::InvalidConfiguration(format!(
                "variable {}: {}",
                self.name, msg
            )))
        };
        match self.kind {
            VariableKind::Uniform(a, b)
            | VariableKind::Linear(a, b)
            | VariableKind::ActiveLearning(a, b)
                if a > b =>
            {
                invalid("lower bound greater than upper bound")
            }
            VariableKind::LogUniform(a, b) if a <= 0. || a > b => {
                invalid("log-uniform bounds must be positive and ordered")
            }
            VariableKind::Normal(_, sigma) if sigma < 0. => invalid("negative standard deviation"),
            VariableKind::Independent(a, b, step) if step <= 0. || a > b => {
                invalid("independent axis needs a positive step and ordered bounds")
            }
            _ => Ok(()),
        }
    }

    pub fn is_input(&self) -> bool {
        match self.kind {
            VariableKind::Output(_) | VariableKind::Independent(..) => false,
            _ => true,
        }
    }

    pub fn is_output(&self) -> bool {
        match self.kind {
            VariableKind::Output(_) => true,
            _ => false,
        }
    }

    pub fn is_active(&self) -> bool {
        match self.kind {
            VariableKind::ActiveLearning(..) => true,
            _ => false,
        }
    }

    /// Lower and upper bound of the input domain, if bounded.
    pub fn bounds(&self) -> Option<(Float, Float)> {
        match self.kind {
            VariableKind::Uniform(a, b)
            | VariableKind::LogUniform(a, b)
            | VariableKind::Linear(a, b)
            | VariableKind::ActiveLearning(a, b)
            | VariableKind::Independent(a, b, _) => Some((a, b)),
            VariableKind::Constant(c) => Some((c, c)),
            _ => None,
        }
    }

    /// Points of an independent variable axis.
    pub fn axis(&self) -> Option<Vec<Float>> {
        match self.kind {
            VariableKind::Independent(a, b, step) => {
                let n = ((b - a) / step + 1e-9).floor() as usize + 1;
                Some((0..n).map(|i| a + i as Float * step).collect())
            }
            _ => None,
        }
    }

    /// Draws `n` values, where `n` is the size of the batch being sampled.
    pub fn sample(&self, n: usize, rng: &mut StdRng) -> Result<Vec<Var>> {
        let mut floats = Vec::with_capacity(n);
        match self.kind {
            VariableKind::Uniform(a, b) | VariableKind::ActiveLearning(a, b) => {
                for _ in 0..n {
                    floats.push(uniform(rng, a, b));
                }
            }
            VariableKind::LogUniform(a, b) => {
                for _ in 0..n {
                    floats.push(uniform(rng, a.ln(), b.ln()).exp());
                }
            }
            VariableKind::Normal(mu, sigma) => {
                let normal = Normal::new(mu, sigma)
                    .map_err(|e| Error::InvalidConfiguration(format!("{}: {}", self.name, e)))?;
                for _ in 0..n {
                    floats.push(normal.sample(rng));
                }
            }
            VariableKind::Linear(a, b) => {
                floats.extend(crate::util::linspace(a, b, n));
            }
            VariableKind::Constant(c) => floats.resize(n, c),
            VariableKind::Independent(..) | VariableKind::Output(_) => {
                return Err(Error::Other(format!(
                    "variable {} is not an input and can't be sampled",
                    self.name
                )))
            }
        }
        floats
            .into_iter()
            .map(|f| Var::from_float(self.dtype, f))
            .collect()
    }
}

fn uniform(rng: &mut StdRng, a: Float, b: Float) -> Float {
    if a == b {
        a
    } else {
        rng.gen_range(a..b)
    }
}

/// Ordered collection of all declared variables.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Variables {
    list: Vec<Variable>,
}

impl Variables {
    pub fn from_entries(entries: &LinkedHashMap<String, VariableEntry>) -> Result<Variables> {
        let mut list = Vec::with_capacity(entries.len());
        for (name, entry) in entries {
            list.push(Variable::from_entry(name, entry)?);
        }
        let variables = Variables { list };
        for var in variables.outputs() {
            if let VariableKind::Output(Some(dep)) = &var.kind {
                match variables.get(dep) {
                    Some(Variable {
                        kind: VariableKind::Independent(..),
                        ..
                    }) => (),
                    _ => {
                        return Err(Error::InvalidConfiguration(format!(
                            "output {} depends on unknown independent variable {}",
                            var.name, dep
                        )))
                    }
                }
                if var.dtype != VarType::FloatList {
                    return Err(Error::InvalidConfiguration(format!(
                        "output {} depends on {} and must be a float_list",
                        var.name, dep
                    )));
                }
            }
        }
        Ok(variables)
    }

    pub fn all(&self) -> &[Variable] {
        &self.list
    }

    pub fn get(&self, name: &str) -> Option<&Variable> {
        self.list.iter().find(|v| v.name == name)
    }

    pub fn inputs(&self) -> impl Iterator<Item = &Variable> {
        self.list.iter().filter(|v| v.is_input())
    }

    pub fn outputs(&self) -> impl Iterator<Item = &Variable> {
        self.list.iter().filter(|v| v.is_output())
    }

    pub fn has_active(&self) -> bool {
        self.list.iter().any(|v| v.is_active())
    }

    pub fn input_schema(&self) -> Schema {
        Schema::new(
            self.inputs()
                .map(|v| Field {
                    name: v.name.clone(),
                    vtype: v.dtype,
                    len: None,
                })
                .collect(),
        )
    }

    pub fn output_schema(&self) -> Schema {
        Schema::new(
            self.outputs()
                .map(|v| {
                    let len = match &v.kind {
                        VariableKind::Output(Some(dep)) => self
                            .get(dep)
                            .and_then(|d| d.axis())
                            .map(|axis| axis.len()),
                        _ => None,
                    };
                    Field {
                        name: v.name.clone(),
                        vtype: v.dtype,
                        len,
                    }
                })
                .collect(),
        )
    }

    /// Samples `n` input rows. Sampling is reproducible when `seed` is
    /// given.
    pub fn sample_inputs(&self, n: usize, seed: Option<u64>) -> Result<Vec<Row>> {
        let mut rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        self.sample_inputs_with(n, &mut rng)
    }

    pub fn sample_inputs_with(&self, n: usize, rng: &mut StdRng) -> Result<Vec<Row>> {
        let schema = Arc::new(self.input_schema());
        let mut columns = Vec::with_capacity(schema.len());
        for var in self.inputs() {
            columns.push(var.sample(n, rng)?.into_iter());
        }
        let mut rows = Vec::with_capacity(n);
        for _ in 0..n {
            let mut values = Vec::with_capacity(columns.len());
            for column in columns.iter_mut() {
                if let Some(value) = column.next() {
                    values.push(value);
                }
            }
            rows.push(Row::from_values(schema.clone(), values)?);
        }
        Ok(rows)
    }
}
