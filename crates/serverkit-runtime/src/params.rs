//! Declarative parameter schemas and argument binding.
//!
//! An algorithm describes its inputs as a [`ParameterSchema`]: a map of
//! named [`ParameterSpec`]s, each with a [`WidgetType`]. The wire form is
//! a JSON-schema-like object:
//!
//! ```json
//! {"properties": {"sigma": {"title": "Sigma", "widget_type": "float",
//!                           "default": 1.0, "minimum": 0.0, "maximum": 10.0}}}
//! ```
//!
//! [`resolve_args`] merges defaults with user overrides, validates them,
//! and resolves layer-typed parameters against the result store.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use serverkit_core::{LayerData, LayerKind, Raster, ResultStore};

use crate::error::{AlgorithmError, ParamError};

/// Input widget a parameter is bound through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WidgetType {
    /// Name of an image layer.
    Image,
    /// Name of a mask layer.
    Mask,
    /// Name of a points layer.
    Points,
    /// Name of a shapes (boxes or paths) layer.
    Shapes,
    /// Name of a vectors layer.
    Vectors,
    /// Name of a tracks layer.
    Tracks,
    /// One of a fixed set of strings.
    Dropdown,
    /// Integer with optional range.
    Int,
    /// Float with optional range.
    Float,
    /// Checkbox.
    Bool,
    /// Free text.
    Str,
}

impl WidgetType {
    /// Layer kinds a layer-typed widget accepts, or `None` for value
    /// widgets.
    #[must_use]
    pub const fn layer_kinds(self) -> Option<&'static [LayerKind]> {
        match self {
            Self::Image => Some(&[LayerKind::Raster]),
            Self::Mask => Some(&[LayerKind::Mask, LayerKind::InstanceMask]),
            Self::Points => Some(&[LayerKind::Points]),
            Self::Shapes => Some(&[LayerKind::Boxes, LayerKind::Paths]),
            Self::Vectors => Some(&[LayerKind::Vectors]),
            Self::Tracks => Some(&[LayerKind::Tracks]),
            Self::Dropdown | Self::Int | Self::Float | Self::Bool | Self::Str => None,
        }
    }

    /// Protocol name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Mask => "mask",
            Self::Points => "points",
            Self::Shapes => "shapes",
            Self::Vectors => "vectors",
            Self::Tracks => "tracks",
            Self::Dropdown => "dropdown",
            Self::Int => "int",
            Self::Float => "float",
            Self::Bool => "bool",
            Self::Str => "str",
        }
    }
}

/// One parameter declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    /// Human-readable label.
    pub title: String,
    /// How the value is entered.
    pub widget_type: WidgetType,
    /// Value used when no override is given.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    /// Inclusive lower bound for numeric widgets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum: Option<f64>,
    /// Inclusive upper bound for numeric widgets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum: Option<f64>,
    /// Increment hint for numeric widgets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<f64>,
    /// Allowed dropdown values.
    #[serde(rename = "enum", default, skip_serializing_if = "Option::is_none")]
    pub choices: Option<Vec<String>>,
    /// Sole dropdown value when there is only one choice.
    #[serde(rename = "const", default, skip_serializing_if = "Option::is_none")]
    pub constant: Option<String>,
    /// Hint for interactive front ends: re-run the algorithm whenever this
    /// value changes. Carried on the wire only; argument resolution and
    /// the runner ignore it.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub auto_call: bool,
}

impl ParameterSpec {
    fn new(title: impl Into<String>, widget_type: WidgetType) -> Self {
        Self {
            title: title.into(),
            widget_type,
            default: None,
            minimum: None,
            maximum: None,
            step: None,
            choices: None,
            constant: None,
            auto_call: false,
        }
    }

    /// A layer-typed parameter (`widget` must be a layer widget).
    #[must_use]
    pub fn layer(title: impl Into<String>, widget: WidgetType) -> Self {
        Self::new(title, widget)
    }

    /// An integer in `[min, max]`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn int(title: impl Into<String>, default: i64, min: i64, max: i64) -> Self {
        Self {
            default: Some(Value::from(default)),
            minimum: Some(min as f64),
            maximum: Some(max as f64),
            ..Self::new(title, WidgetType::Int)
        }
    }

    /// A float in `[min, max]`.
    #[must_use]
    pub fn float(title: impl Into<String>, default: f64, min: f64, max: f64) -> Self {
        Self {
            default: Some(Value::from(default)),
            minimum: Some(min),
            maximum: Some(max),
            ..Self::new(title, WidgetType::Float)
        }
    }

    /// A checkbox.
    #[must_use]
    pub fn bool(title: impl Into<String>, default: bool) -> Self {
        Self {
            default: Some(Value::from(default)),
            ..Self::new(title, WidgetType::Bool)
        }
    }

    /// Free text.
    #[must_use]
    pub fn text(title: impl Into<String>, default: impl Into<String>) -> Self {
        Self {
            default: Some(Value::String(default.into())),
            ..Self::new(title, WidgetType::Str)
        }
    }

    /// One of `choices`; the first is the default.
    #[must_use]
    pub fn dropdown<I, S>(title: impl Into<String>, choices: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let choices: Vec<String> = choices.into_iter().map(Into::into).collect();
        let default = choices.first().cloned().map(Value::String);
        Self {
            default,
            choices: Some(choices),
            ..Self::new(title, WidgetType::Dropdown)
        }
    }

    /// Set the step hint.
    #[must_use]
    pub const fn with_step(mut self, step: f64) -> Self {
        self.step = Some(step);
        self
    }

    /// Ask interactive front ends to re-run the algorithm when this value
    /// changes. Sets the `auto_call` field.
    #[must_use]
    pub const fn auto_call(mut self) -> Self {
        self.auto_call = true;
        self
    }

    /// Allowed dropdown values: `enum`, or the single `const`.
    fn allowed(&self) -> Vec<String> {
        match (&self.choices, &self.constant) {
            (Some(choices), _) => choices.clone(),
            (None, Some(constant)) => vec![constant.clone()],
            (None, None) => Vec::new(),
        }
    }
}

/// An algorithm's parameter declarations, keyed by parameter name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParameterSchema {
    /// Declarations by name.
    pub properties: BTreeMap<String, ParameterSpec>,
}

impl ParameterSchema {
    /// Empty schema.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a parameter.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, spec: ParameterSpec) -> Self {
        self.properties.insert(name.into(), spec);
        self
    }

    /// Name of the first image-typed parameter, in key order.
    #[must_use]
    pub fn image_parameter(&self) -> Option<&str> {
        self.properties
            .iter()
            .find(|(_, spec)| spec.widget_type == WidgetType::Image)
            .map(|(name, _)| name.as_str())
    }
}

/// Resolved invocation arguments.
///
/// Plain values are JSON; layer-typed parameters carry a copy of the
/// referenced layer's data.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Args {
    values: Map<String, Value>,
    layers: BTreeMap<String, LayerData>,
}

impl Args {
    /// Empty argument set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a plain value.
    #[must_use]
    pub fn with_value(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }

    /// Set (or replace) a layer argument.
    pub fn set_layer(&mut self, name: impl Into<String>, data: LayerData) {
        self.layers.insert(name.into(), data);
    }

    /// Builder form of [`Args::set_layer`].
    #[must_use]
    pub fn with_layer(mut self, name: impl Into<String>, data: LayerData) -> Self {
        self.set_layer(name, data);
        self
    }

    /// Raw JSON value of a plain parameter.
    #[must_use]
    pub fn value(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// Plain values by name.
    #[must_use]
    pub const fn values(&self) -> &Map<String, Value> {
        &self.values
    }

    /// Read a float parameter (integers are widened).
    ///
    /// # Errors
    ///
    /// [`AlgorithmError::MissingArgument`] or [`AlgorithmError::WrongType`].
    pub fn f64(&self, name: &str) -> Result<f64, AlgorithmError> {
        self.typed(name, "number", Value::as_f64)
    }

    /// Read an integer parameter.
    ///
    /// # Errors
    ///
    /// [`AlgorithmError::MissingArgument`] or [`AlgorithmError::WrongType`].
    pub fn i64(&self, name: &str) -> Result<i64, AlgorithmError> {
        self.typed(name, "integer", Value::as_i64)
    }

    /// Read a boolean parameter.
    ///
    /// # Errors
    ///
    /// [`AlgorithmError::MissingArgument`] or [`AlgorithmError::WrongType`].
    pub fn bool(&self, name: &str) -> Result<bool, AlgorithmError> {
        self.typed(name, "boolean", Value::as_bool)
    }

    /// Read a string parameter.
    ///
    /// # Errors
    ///
    /// [`AlgorithmError::MissingArgument`] or [`AlgorithmError::WrongType`].
    pub fn str(&self, name: &str) -> Result<&str, AlgorithmError> {
        self.typed(name, "string", Value::as_str)
    }

    /// Data of a layer argument.
    ///
    /// # Errors
    ///
    /// [`AlgorithmError::MissingArgument`] if it was not bound.
    pub fn layer(&self, name: &str) -> Result<&LayerData, AlgorithmError> {
        self.layers
            .get(name)
            .ok_or_else(|| AlgorithmError::MissingArgument(name.to_owned()))
    }

    /// Raster of an image or mask argument.
    ///
    /// # Errors
    ///
    /// [`AlgorithmError::MissingArgument`] or [`AlgorithmError::WrongType`].
    pub fn raster(&self, name: &str) -> Result<&Raster, AlgorithmError> {
        self.layer(name)?
            .as_raster()
            .ok_or_else(|| AlgorithmError::WrongType {
                name: name.to_owned(),
                expected: "raster",
            })
    }

    fn typed<'a, V>(
        &'a self,
        name: &str,
        expected: &'static str,
        read: impl FnOnce(&'a Value) -> Option<V>,
    ) -> Result<V, AlgorithmError> {
        let value = self
            .values
            .get(name)
            .ok_or_else(|| AlgorithmError::MissingArgument(name.to_owned()))?;
        read(value).ok_or_else(|| AlgorithmError::WrongType {
            name: name.to_owned(),
            expected,
        })
    }
}

/// Bind `overrides` over the schema defaults and validate the result.
///
/// Layer-typed parameters take a layer name; the layer's data is copied
/// out of `store`.
///
/// # Errors
///
/// Returns the first [`ParamError`] found.
pub fn resolve_args(
    schema: &ParameterSchema,
    overrides: &Map<String, Value>,
    store: &ResultStore,
) -> Result<Args, ParamError> {
    if let Some(unknown) = overrides
        .keys()
        .find(|name| !schema.properties.contains_key(name.as_str()))
    {
        return Err(ParamError::Unknown(unknown.clone()));
    }

    let mut args = Args::new();
    for (name, spec) in &schema.properties {
        let value = overrides
            .get(name)
            .or(spec.default.as_ref())
            .ok_or_else(|| ParamError::Missing(name.clone()))?;

        if let Some(kinds) = spec.widget_type.layer_kinds() {
            let layer_name = value.as_str().ok_or_else(|| wrong_type(name, "layer name", value))?;
            let layer = store.read(layer_name).map_err(|source| ParamError::Layer {
                name: name.clone(),
                source,
            })?;
            if !kinds.contains(&layer.kind) {
                return Err(ParamError::LayerKind {
                    name: name.clone(),
                    widget: spec.widget_type.as_str(),
                    layer: layer_name.to_owned(),
                    kind: layer.kind,
                });
            }
            args.set_layer(name.clone(), layer.data.clone());
            args.values.insert(name.clone(), value.clone());
            continue;
        }

        let bound = match spec.widget_type {
            WidgetType::Int => {
                let n = value.as_i64().ok_or_else(|| wrong_type(name, "integer", value))?;
                #[allow(clippy::cast_precision_loss)]
                check_range(name, spec, n as f64)?;
                Value::from(n)
            }
            WidgetType::Float => {
                let x = value.as_f64().ok_or_else(|| wrong_type(name, "number", value))?;
                check_range(name, spec, x)?;
                Value::from(x)
            }
            WidgetType::Bool => {
                Value::from(value.as_bool().ok_or_else(|| wrong_type(name, "boolean", value))?)
            }
            WidgetType::Dropdown => {
                let choice = value.as_str().ok_or_else(|| wrong_type(name, "string", value))?;
                let allowed = spec.allowed();
                if !allowed.iter().any(|c| c == choice) {
                    return Err(ParamError::InvalidChoice {
                        name: name.clone(),
                        value: choice.to_owned(),
                        choices: allowed,
                    });
                }
                value.clone()
            }
            _ => match value {
                Value::String(_) => value.clone(),
                other => Value::String(other.to_string()),
            },
        };
        args.values.insert(name.clone(), bound);
    }
    Ok(args)
}

fn wrong_type(name: &str, expected: &'static str, value: &Value) -> ParamError {
    ParamError::WrongType {
        name: name.to_owned(),
        expected,
        actual: value.to_string(),
    }
}

fn check_range(name: &str, spec: &ParameterSpec, value: f64) -> Result<(), ParamError> {
    let min = spec.minimum.unwrap_or(f64::NEG_INFINITY);
    let max = spec.maximum.unwrap_or(f64::INFINITY);
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(ParamError::OutOfRange {
            name: name.to_owned(),
            value,
            min,
            max,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;
    use serverkit_core::Table;

    use super::*;

    fn schema() -> ParameterSchema {
        ParameterSchema::new()
            .with("image", ParameterSpec::layer("Image", WidgetType::Image))
            .with("sigma", ParameterSpec::float("Sigma", 1.0, 0.0, 10.0))
            .with("radius", ParameterSpec::int("Radius", 3, 1, 9))
            .with("method", ParameterSpec::dropdown("Method", ["otsu", "mean"]))
            .with("invert", ParameterSpec::bool("Invert", false))
    }

    fn store() -> ResultStore {
        let mut store = ResultStore::new();
        store
            .create(
                LayerKind::Raster,
                LayerData::Raster(Raster::zeros(&[4, 4]).unwrap()),
                "img",
                Map::new(),
            )
            .unwrap();
        store
            .create(
                LayerKind::Points,
                LayerData::Points(Table::new(2)),
                "pts",
                Map::new(),
            )
            .unwrap();
        store
    }

    fn overrides(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn defaults_fill_unset_parameters() {
        let args = resolve_args(&schema(), &overrides(json!({"image": "img"})), &store()).unwrap();
        assert_eq!(args.f64("sigma").unwrap(), 1.0);
        assert_eq!(args.i64("radius").unwrap(), 3);
        assert_eq!(args.str("method").unwrap(), "otsu");
        assert!(!args.bool("invert").unwrap());
        assert_eq!(args.raster("image").unwrap().shape(), [4, 4]);
    }

    #[test]
    fn missing_layer_without_default_is_an_error() {
        let err = resolve_args(&schema(), &Map::new(), &store()).unwrap_err();
        assert_eq!(err, ParamError::Missing("image".into()));
    }

    #[test]
    fn range_and_choice_are_checked() {
        let store = store();
        let err = resolve_args(
            &schema(),
            &overrides(json!({"image": "img", "sigma": 11.0})),
            &store,
        )
        .unwrap_err();
        assert!(matches!(err, ParamError::OutOfRange { .. }));

        let err = resolve_args(
            &schema(),
            &overrides(json!({"image": "img", "method": "max"})),
            &store,
        )
        .unwrap_err();
        assert!(matches!(err, ParamError::InvalidChoice { .. }));

        let err = resolve_args(
            &schema(),
            &overrides(json!({"image": "img", "radius": 2.5})),
            &store,
        )
        .unwrap_err();
        assert!(matches!(err, ParamError::WrongType { .. }));
    }

    #[test]
    fn layer_kind_must_match_widget() {
        let err =
            resolve_args(&schema(), &overrides(json!({"image": "pts"})), &store()).unwrap_err();
        assert!(matches!(err, ParamError::LayerKind { kind: LayerKind::Points, .. }));

        let err =
            resolve_args(&schema(), &overrides(json!({"image": "nope"})), &store()).unwrap_err();
        assert!(matches!(err, ParamError::Layer { .. }));
    }

    #[test]
    fn unknown_override_is_rejected() {
        let err = resolve_args(
            &schema(),
            &overrides(json!({"image": "img", "gamma": 2})),
            &store(),
        )
        .unwrap_err();
        assert_eq!(err, ParamError::Unknown("gamma".into()));
    }

    #[test]
    fn const_dropdown_accepts_its_only_value() {
        let spec = ParameterSpec {
            choices: None,
            constant: Some("only".into()),
            default: Some(json!("only")),
            ..ParameterSpec::dropdown("Mode", Vec::<String>::new())
        };
        let schema = ParameterSchema::new().with("mode", spec);
        let args = resolve_args(&schema, &Map::new(), &ResultStore::new()).unwrap();
        assert_eq!(args.str("mode").unwrap(), "only");
    }

    #[test]
    fn auto_call_is_a_wire_hint_only() {
        let hinted = ParameterSchema::new()
            .with("image", ParameterSpec::layer("Image", WidgetType::Image))
            .with("sigma", ParameterSpec::float("Sigma", 1.0, 0.0, 10.0).auto_call());
        let json = serde_json::to_value(&hinted).unwrap();
        assert_eq!(json["properties"]["sigma"]["auto_call"], json!(true));

        let args = resolve_args(
            &hinted,
            &overrides(json!({"image": "img", "sigma": 2.5})),
            &store(),
        )
        .unwrap();
        assert_eq!(args.f64("sigma").unwrap(), 2.5);
    }

    #[test]
    fn schema_wire_form_uses_protocol_names() {
        let json = serde_json::to_value(&schema()).unwrap();
        let method = &json["properties"]["method"];
        assert_eq!(method["widget_type"], "dropdown");
        assert_eq!(method["enum"], json!(["otsu", "mean"]));
        assert!(method.get("auto_call").is_none());
        let back: ParameterSchema = serde_json::from_value(json).unwrap();
        assert_eq!(back, schema());
        assert_eq!(back.image_parameter(), Some("image"));
    }
}
