//! Variable types and their transformations.

use std::fmt;

use serde_repr::*;

use crate::error::{Error, Result};
use crate::{Float, Int};

// default values for base var types
const DEFAULT_STR_VALUE: &str = "";
const DEFAULT_INT_VALUE: Int = 0;
const DEFAULT_FLOAT_VALUE: Float = 0.0;
const DEFAULT_BOOL_VALUE: bool = false;

const STR_VAR_TYPE_NAME: &str = "str";
const STR_VAR_TYPE_NAME_ALT: &str = "string";
const INT_VAR_TYPE_NAME: &str = "int";
const INT_VAR_TYPE_NAME_ALT: &str = "integer";
const FLOAT_VAR_TYPE_NAME: &str = "float";
const FLOAT_VAR_TYPE_NAME_ALT: &str = "flt";
const BOOL_VAR_TYPE_NAME: &str = "bool";
const BOOL_VAR_TYPE_NAME_ALT: &str = "boolean";
const FLOAT_LIST_VAR_TYPE_NAME: &str = "float_list";
const FLOAT_LIST_VAR_TYPE_NAME_ALT: &str = "flt_list";

/// Defines all possible kinds of data a row cell can hold.
#[derive(
    Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize_repr, Deserialize_repr,
)]
#[repr(u8)]
pub enum VarType {
    Float,
    Int,
    Bool,
    String,
    FloatList,
}

impl fmt::Display for VarType {
    fn fmt(&self, formatter: &mut fmt::Formatter) -> std::result::Result<(), fmt::Error> {
        write!(formatter, "{}", self.to_str())
    }
}

/// List of all possible variable types.
pub static VAR_TYPES: &[&str; 5] = &[
    FLOAT_VAR_TYPE_NAME,
    INT_VAR_TYPE_NAME,
    BOOL_VAR_TYPE_NAME,
    STR_VAR_TYPE_NAME,
    FLOAT_LIST_VAR_TYPE_NAME,
];

impl VarType {
    /// Creates new `VarType` from str.
    pub fn from_str(s: &str) -> Result<VarType> {
        let var_type = match s {
            FLOAT_VAR_TYPE_NAME | FLOAT_VAR_TYPE_NAME_ALT | "f64" | "float64" => VarType::Float,
            INT_VAR_TYPE_NAME | INT_VAR_TYPE_NAME_ALT | "i64" | "int64" => VarType::Int,
            BOOL_VAR_TYPE_NAME | BOOL_VAR_TYPE_NAME_ALT => VarType::Bool,
            STR_VAR_TYPE_NAME | STR_VAR_TYPE_NAME_ALT => VarType::String,
            FLOAT_LIST_VAR_TYPE_NAME | FLOAT_LIST_VAR_TYPE_NAME_ALT => VarType::FloatList,
            _ => return Err(Error::InvalidVarType(s.to_string())),
        };
        Ok(var_type)
    }

    pub fn to_str(&self) -> &str {
        match self {
            VarType::Float => FLOAT_VAR_TYPE_NAME,
            VarType::Int => INT_VAR_TYPE_NAME,
            VarType::Bool => BOOL_VAR_TYPE_NAME,
            VarType::String => STR_VAR_TYPE_NAME,
            VarType::FloatList => FLOAT_LIST_VAR_TYPE_NAME,
        }
    }

    /// Whether values of this type can be used as surrogate features.
    pub fn is_numeric(&self) -> bool {
        match self {
            VarType::Float | VarType::Int | VarType::Bool => true,
            _ => false,
        }
    }

    /// Default value for this type, used for unset cells.
    pub fn default_var(&self) -> Var {
        match self {
            VarType::Float => Var::Float(DEFAULT_FLOAT_VALUE),
            VarType::Int => Var::Int(DEFAULT_INT_VALUE),
            VarType::Bool => Var::Bool(DEFAULT_BOOL_VALUE),
            VarType::String => Var::String(DEFAULT_STR_VALUE.to_string()),
            VarType::FloatList => Var::FloatList(Vec::new()),
        }
    }
}

/// Single value stored in a row cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Var {
    Float(Float),
    Int(Int),
    Bool(bool),
    String(String),
    FloatList(Vec<Float>),
}

impl fmt::Display for Var {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Var::Float(v) => write!(f, "{}", v),
            Var::Int(v) => write!(f, "{}", v),
            Var::Bool(v) => write!(f, "{}", v),
            Var::String(v) => write!(f, "{}", v),
            Var::FloatList(v) => write!(
                f,
                "[{}]",
                v.iter()
                    .map(|x| x.to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        }
    }
}

impl Var {
    pub fn get_type(&self) -> VarType {
        match self {
            Var::Float(_) => VarType::Float,
            Var::Int(_) => VarType::Int,
            Var::Bool(_) => VarType::Bool,
            Var::String(_) => VarType::String,
            Var::FloatList(_) => VarType::FloatList,
        }
    }

    /// Creates a new var of the given type from a float, rounding for
    /// integer types.
    pub fn from_float(target_type: VarType, value: Float) -> Result<Var> {
        let var = match target_type {
            VarType::Float => Var::Float(value),
            VarType::Int => Var::Int(value.round() as Int),
            VarType::Bool => Var::Bool(value != 0.0),
            VarType::String => Var::String(value.to_string()),
            VarType::FloatList => Var::FloatList(vec![value]),
        };
        Ok(var)
    }

    /// Parses a var of the given type from string.
    pub fn from_str(s: &str, target_type: VarType) -> Result<Var> {
        let s = s.trim();
        let var = match target_type {
            VarType::Float => Var::Float(s.parse()?),
            VarType::Int => Var::Int(s.parse()?),
            VarType::Bool => Var::Bool(s.parse()?),
            VarType::String => Var::String(s.to_string()),
            VarType::FloatList => {
                let inner = s.trim_start_matches('[').trim_end_matches(']');
                let mut list: Vec<Float> = Vec::new();
                for part in inner.split(|c| c == ',' || c == ' ') {
                    if part.trim().is_empty() {
                        continue;
                    }
                    list.push(part.trim().parse()?);
                }
                Var::FloatList(list)
            }
        };
        Ok(var)
    }

    /// Numeric view of the value, if there is one.
    pub fn as_float(&self) -> Option<Float> {
        match self {
            Var::Float(v) => Some(*v),
            Var::Int(v) => Some(*v as Float),
            Var::Bool(v) => Some(if *v { 1.0 } else { 0.0 }),
            Var::String(s) => s.parse().ok(),
            Var::FloatList(_) => None,
        }
    }

    /// Flattens the value into floats, used for surrogate targets.
    pub fn to_floats(&self) -> Vec<Float> {
        match self {
            Var::FloatList(v) => v.clone(),
            other => other.as_float().into_iter().collect(),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Var::Float(v) => serde_json::json!(v),
            Var::Int(v) => serde_json::json!(v),
            Var::Bool(v) => serde_json::json!(v),
            Var::String(v) => serde_json::json!(v),
            Var::FloatList(v) => serde_json::json!(v),
        }
    }

    /// Converts a json value into a var of the given type.
    pub fn from_json(value: &serde_json::Value, target_type: VarType) -> Result<Var> {
        use serde_json::Value;
        let var = match (target_type, value) {
            (VarType::Float, Value::Number(n)) => Var::Float(
                n.as_f64()
                    .ok_or_else(|| Error::ParsingError(format!("not a float: {}", n)))?,
            ),
            (VarType::Int, Value::Number(n)) => match n.as_i64() {
                Some(i) => Var::Int(i),
                None => Var::from_float(VarType::Int, n.as_f64().unwrap_or_default())?,
            },
            (VarType::Bool, Value::Bool(b)) => Var::Bool(*b),
            (VarType::String, Value::String(s)) => Var::String(s.clone()),
            (VarType::FloatList, Value::Array(items)) => {
                let mut list = Vec::with_capacity(items.len());
                for item in items {
                    list.push(item.as_f64().ok_or_else(|| {
                        Error::ParsingError(format!("not a float list element: {}", item))
                    })?);
                }
                Var::FloatList(list)
            }
            (VarType::FloatList, Value::Number(n)) => {
                Var::FloatList(vec![n.as_f64().unwrap_or_default()])
            }
            (_, Value::String(s)) => Var::from_str(s, target_type)?,
            (t, v) => {
                return Err(Error::ParsingError(format!(
                    "can't convert json value {} into {}",
                    v, t
                )))
            }
        };
        Ok(var)
    }
}

#[test]
fn var_type_from_str_accepts_aliases() {
    assert_eq!(VarType::from_str("flt").unwrap(), VarType::Float);
    assert_eq!(VarType::from_str("integer").unwrap(), VarType::Int);
    assert_eq!(VarType::from_str("float_list").unwrap(), VarType::FloatList);
    assert!(VarType::from_str("complex").is_err());
}

#[test]
fn var_from_float_rounds_ints() {
    assert_eq!(Var::from_float(VarType::Int, 2.6).unwrap(), Var::Int(3));
    assert_eq!(Var::from_float(VarType::Float, 2.6).unwrap(), Var::Float(2.6));
}

#[test]
fn var_json_conversion_follows_target_type() {
    let v = serde_json::json!(3);
    assert_eq!(Var::from_json(&v, VarType::Float).unwrap(), Var::Float(3.0));
    assert_eq!(Var::from_json(&v, VarType::Int).unwrap(), Var::Int(3));
    let list = serde_json::json!([1.0, 2.5]);
    assert_eq!(
        Var::from_json(&list, VarType::FloatList).unwrap(),
        Var::FloatList(vec![1.0, 2.5])
    );
    assert!(Var::from_json(&serde_json::json!(true), VarType::Float).is_err());
}
