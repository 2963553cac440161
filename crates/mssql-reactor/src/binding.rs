//! Parameter bindings for parameterized queries.
//!
//! A [`Binding`] carries the named parameters of one execution in
//! caller-supplied order, each with its RPC direction. The binding also
//! produces the formal parameter declaration string passed to `sp_executesql`
//! and the cursor procedures, and the type fingerprint used as part of the
//! prepared-statement cache key.

use tds_wire::{RpcDirection, RpcValue};

/// A single bound parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundParameter {
    /// Parameter name without the `@` prefix.
    pub name: String,
    /// RPC direction.
    pub direction: RpcDirection,
    /// Parameter value.
    pub value: RpcValue,
}

/// An ordered collection of named parameters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Binding {
    params: Vec<BoundParameter>,
}

impl Binding {
    /// An empty binding.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Whether the binding holds no parameters.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Number of bound parameters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.params.len()
    }

    /// Append an IN parameter.
    pub fn add(&mut self, name: impl Into<String>, value: RpcValue) {
        self.add_with_direction(name, RpcDirection::In, value);
    }

    /// Append a parameter with an explicit direction.
    pub fn add_with_direction(
        &mut self,
        name: impl Into<String>,
        direction: RpcDirection,
        value: RpcValue,
    ) {
        self.params.push(BoundParameter {
            name: name.into(),
            direction,
            value,
        });
    }

    /// Builder-style variant of [`Binding::add`].
    #[must_use]
    pub fn bind(mut self, name: impl Into<String>, value: RpcValue) -> Self {
        self.add(name, value);
        self
    }

    /// Iterate over the bound parameters in order.
    pub fn iter(&self) -> impl Iterator<Item = &BoundParameter> {
        self.params.iter()
    }

    /// The formal parameter declaration string, e.g.
    /// `@id int,@name nvarchar(5)`. Empty when the binding is empty.
    #[must_use]
    pub fn formal_parameters(&self) -> String {
        self.params
            .iter()
            .map(|param| format!("@{} {}", param.name, param.value.type_declaration()))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// The ordered list of formal parameter type declarations, independent of
    /// the bound values. Together with the query text this identifies a
    /// prepared statement.
    #[must_use]
    pub fn type_fingerprint(&self) -> String {
        self.params
            .iter()
            .map(|param| param.value.type_declaration())
            .collect::<Vec<_>>()
            .join("|")
    }
}
