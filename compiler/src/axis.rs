// axis.rs — AxisCatalog: input paths → shapes
//
// Walks the declared input structure once and records, for every reachable
// path, the ordered list of array boundaries it crosses. Array steps add one
// axis (named by the alias if given, else the field name); object steps add
// none. The catalog also records how to reach each path from the innermost
// enclosing array element, which the loop builder uses to load values.
//
// Preconditions: field names are unique within each object/element.
// Postconditions: every path has a shape; no two arrays share an axis name.
// Failure modes: duplicate axis names (`DuplicateAxis`); unknown paths on lookup.
// Side effects: none.

use std::collections::HashMap;

use crate::ast::{self, ElemType};
use crate::error::{CompileError, Result};
use crate::shape::{Axis, Shape};

// ── Input model ─────────────────────────────────────────────────────────────

/// One named field of the input document.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: String,
    pub ty: FieldType,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldType {
    Scalar(ElemType),
    Object(Vec<Field>),
    Array {
        alias: Option<String>,
        element: Element,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Element {
    Scalar(ElemType),
    Object(Vec<Field>),
}

impl Field {
    pub fn scalar(name: &str, ty: ElemType) -> Self {
        Field {
            name: name.to_string(),
            ty: FieldType::Scalar(ty),
        }
    }

    pub fn object(name: &str, fields: Vec<Field>) -> Self {
        Field {
            name: name.to_string(),
            ty: FieldType::Object(fields),
        }
    }

    pub fn array(name: &str, fields: Vec<Field>) -> Self {
        Field {
            name: name.to_string(),
            ty: FieldType::Array {
                alias: None,
                element: Element::Object(fields),
            },
        }
    }

    pub fn array_of(name: &str, ty: ElemType) -> Self {
        Field {
            name: name.to_string(),
            ty: FieldType::Array {
                alias: None,
                element: Element::Scalar(ty),
            },
        }
    }

    pub fn with_alias(mut self, alias: &str) -> Self {
        if let FieldType::Array { alias: slot, .. } = &mut self.ty {
            *slot = Some(alias.to_string());
        }
        self
    }
}

impl From<&ast::InputField> for Field {
    fn from(field: &ast::InputField) -> Self {
        let ty = match &field.ty {
            ast::InputType::Scalar(t) => FieldType::Scalar(*t),
            ast::InputType::Object(fields) => {
                FieldType::Object(fields.iter().map(Field::from).collect())
            }
            ast::InputType::Array { alias, element } => FieldType::Array {
                alias: alias.as_ref().map(|a| a.name.clone()),
                element: match element {
                    ast::ArrayElement::Scalar(t) => Element::Scalar(*t),
                    ast::ArrayElement::Object(fields) => {
                        Element::Object(fields.iter().map(Field::from).collect())
                    }
                },
            },
        };
        Field {
            name: field.name.name.clone(),
            ty,
        }
    }
}

// ── Catalog entries ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    Scalar(ElemType),
    Object,
    /// The path names an array; its value is the current element.
    Array,
}

/// Where a path's value lives relative to the loop nest: the innermost
/// array it crosses (`None` for the document root) and the object keys
/// from that array's element down to the value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Access {
    pub base: Option<Axis>,
    pub keys: Vec<String>,
}

/// One resolvable input path.
#[derive(Debug, Clone, PartialEq)]
pub struct InputSpec {
    /// Dotted path without the `input.` prefix.
    pub path: String,
    pub kind: InputKind,
    pub shape: Shape,
    pub access: Access,
}

/// One array boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AxisInfo {
    pub axis: Axis,
    /// Dotted path of the array field.
    pub collection: String,
    /// The enclosing axis, if the array sits inside another array's elements.
    pub parent: Option<Axis>,
    /// Keys from the parent element (or the root) to the array field.
    pub keys: Vec<String>,
}

// ── Catalog ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct AxisCatalog {
    specs: Vec<InputSpec>,
    by_path: HashMap<String, usize>,
    axes: Vec<AxisInfo>,
    by_axis: HashMap<Axis, usize>,
}

/// Walk position while building.
struct Cursor<'a> {
    path: &'a [String],
    shape: &'a Shape,
    parent: Option<&'a Axis>,
    keys: &'a [String],
}

impl AxisCatalog {
    /// Build the catalog from the declared input fields.
    pub fn build(fields: &[Field]) -> Result<Self> {
        let mut catalog = AxisCatalog::default();
        let root_shape = Shape::scalar();
        let cursor = Cursor {
            path: &[],
            shape: &root_shape,
            parent: None,
            keys: &[],
        };
        catalog.walk(fields, &cursor)?;
        Ok(catalog)
    }

    pub fn from_ast(fields: &[ast::InputField]) -> Result<Self> {
        let fields: Vec<Field> = fields.iter().map(Field::from).collect();
        Self::build(&fields)
    }

    fn walk(&mut self, fields: &[Field], at: &Cursor<'_>) -> Result<()> {
        for field in fields {
            let mut path = at.path.to_vec();
            path.push(field.name.clone());
            let mut keys = at.keys.to_vec();
            keys.push(field.name.clone());
            let dotted = path.join(".");

            match &field.ty {
                FieldType::Scalar(t) => {
                    self.add_spec(dotted, InputKind::Scalar(*t), at.shape.clone(), at.parent, keys);
                }
                FieldType::Object(children) => {
                    self.add_spec(dotted, InputKind::Object, at.shape.clone(), at.parent, keys.clone());
                    let cursor = Cursor {
                        path: &path,
                        shape: at.shape,
                        parent: at.parent,
                        keys: &keys,
                    };
                    self.walk(children, &cursor)?;
                }
                FieldType::Array { alias, element } => {
                    let axis = Axis::new(alias.clone().unwrap_or_else(|| field.name.clone()));
                    if let Some(&existing) = self.by_axis.get(&axis) {
                        return Err(CompileError::DuplicateAxis {
                            axis: axis.0.clone(),
                            first: self.axes[existing].collection.clone(),
                            second: dotted,
                        });
                    }
                    self.by_axis.insert(axis.clone(), self.axes.len());
                    self.axes.push(AxisInfo {
                        axis: axis.clone(),
                        collection: dotted.clone(),
                        parent: at.parent.cloned(),
                        keys,
                    });

                    let mut axes = at.shape.axes().to_vec();
                    axes.push(axis.clone());
                    let shape = Shape::new(axes);
                    let kind = match element {
                        Element::Scalar(t) => InputKind::Scalar(*t),
                        Element::Object(_) => InputKind::Array,
                    };
                    self.add_spec(dotted, kind, shape.clone(), Some(&axis), Vec::new());

                    if let Element::Object(children) = element {
                        let cursor = Cursor {
                            path: &path,
                            shape: &shape,
                            parent: Some(&axis),
                            keys: &[],
                        };
                        self.walk(children, &cursor)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn add_spec(
        &mut self,
        path: String,
        kind: InputKind,
        shape: Shape,
        base: Option<&Axis>,
        keys: Vec<String>,
    ) {
        self.by_path.insert(path.clone(), self.specs.len());
        self.specs.push(InputSpec {
            path,
            kind,
            shape,
            access: Access {
                base: base.cloned(),
                keys,
            },
        });
    }

    // ── Queries ─────────────────────────────────────────────────────────────

    /// Shape of an input path (with or without the `input.` prefix).
    pub fn shape_of(&self, path: &str) -> Result<Shape> {
        self.spec(path).map(|s| s.shape.clone())
    }

    pub fn spec(&self, path: &str) -> Result<&InputSpec> {
        let key = path.strip_prefix("input.").unwrap_or(path);
        self.by_path
            .get(key)
            .map(|&i| &self.specs[i])
            .ok_or_else(|| CompileError::UnknownPath {
                path: key.to_string(),
            })
    }

    /// Base axis and key path used to load `path` from the innermost element.
    pub fn access(&self, path: &str) -> Result<&Access> {
        self.spec(path).map(|s| &s.access)
    }

    pub fn axis(&self, axis: &Axis) -> Option<&AxisInfo> {
        self.by_axis.get(axis).map(|&i| &self.axes[i])
    }

    /// All paths in declaration order.
    pub fn specs(&self) -> &[InputSpec] {
        &self.specs
    }

    pub fn axes(&self) -> &[AxisInfo] {
        &self.axes
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> AxisCatalog {
        AxisCatalog::build(&[
            Field::scalar("title", ElemType::String),
            Field::object("config", vec![Field::scalar("bias", ElemType::Float)]),
            Field::array(
                "items",
                vec![
                    Field::scalar("price", ElemType::Float),
                    Field::scalar("quantity", ElemType::Integer),
                    Field::object(
                        "meta",
                        vec![Field::array_of("tags", ElemType::String)],
                    ),
                ],
            ),
            Field::array(
                "batch",
                vec![Field::array(
                    "row",
                    vec![Field::array("col", vec![Field::scalar("val", ElemType::Float)])],
                )],
            ),
        ])
        .unwrap()
    }

    fn s(names: &[&str]) -> Shape {
        Shape::from_names(names.iter().copied())
    }

    #[test]
    fn scalar_paths_are_rank_zero() {
        let cat = sample();
        assert_eq!(cat.shape_of("title").unwrap(), Shape::scalar());
        assert_eq!(cat.shape_of("config.bias").unwrap(), Shape::scalar());
        assert_eq!(cat.shape_of("input.config").unwrap(), Shape::scalar());
    }

    #[test]
    fn arrays_add_axes() {
        let cat = sample();
        assert_eq!(cat.shape_of("items").unwrap(), s(&["items"]));
        assert_eq!(cat.shape_of("items.price").unwrap(), s(&["items"]));
        assert_eq!(
            cat.shape_of("batch.row.col.val").unwrap(),
            s(&["batch", "row", "col"])
        );
    }

    #[test]
    fn objects_are_transparent() {
        let cat = sample();
        // items → meta (object) → tags (array): two array boundaries
        assert_eq!(cat.shape_of("items.meta.tags").unwrap(), s(&["items", "tags"]));
        let tags = cat.axis(&Axis::new("tags")).unwrap();
        assert_eq!(tags.parent, Some(Axis::new("items")));
        assert_eq!(tags.keys, vec!["meta".to_string(), "tags".to_string()]);
    }

    #[test]
    fn access_is_relative_to_innermost_array() {
        let cat = sample();
        let spec = cat.spec("batch.row.col.val").unwrap();
        assert_eq!(spec.access.base, Some(Axis::new("col")));
        assert_eq!(spec.access.keys, vec!["val".to_string()]);

        let bias = cat.spec("config.bias").unwrap();
        assert_eq!(bias.access.base, None);
        assert_eq!(bias.access.keys, vec!["config".to_string(), "bias".to_string()]);

        let items = cat.spec("items").unwrap();
        assert_eq!(items.kind, InputKind::Array);
        assert_eq!(items.access.base, Some(Axis::new("items")));
        assert!(items.access.keys.is_empty());
    }

    #[test]
    fn alias_names_the_axis() {
        let cat = AxisCatalog::build(&[Field::array(
            "employees",
            vec![Field::scalar("salary", ElemType::Float)],
        )
        .with_alias("emp")])
        .unwrap();
        assert_eq!(cat.shape_of("employees.salary").unwrap(), s(&["emp"]));
        assert_eq!(cat.axis(&Axis::new("emp")).unwrap().collection, "employees");
    }

    #[test]
    fn unknown_path() {
        let cat = sample();
        let err = cat.shape_of("items.cost").unwrap_err();
        assert_eq!(
            err,
            CompileError::UnknownPath {
                path: "items.cost".into()
            }
        );
    }

    #[test]
    fn duplicate_axis_rejected() {
        let err = AxisCatalog::build(&[
            Field::array("a", vec![Field::array("x", vec![])]),
            Field::array("b", vec![Field::array("x", vec![])]),
        ])
        .unwrap_err();
        assert!(matches!(err, CompileError::DuplicateAxis { ref axis, .. } if axis == "x"));
    }

    #[test]
    fn built_from_parsed_input_block() {
        let parsed = crate::parser::parse("input { array orders as o { object info { float total } } }");
        let schema = parsed.schema.unwrap();
        let cat = AxisCatalog::from_ast(&schema.inputs).unwrap();
        assert_eq!(cat.shape_of("orders.info.total").unwrap(), s(&["o"]));
    }
}
