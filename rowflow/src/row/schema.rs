//! Compiled accessor tables for statically-typed rows.
//!
//! A typed row declares its fields once per type through [`SchemaRow`];
//! the resulting [`Schema`] is a table of plain function pointers, so
//! per-row access never goes through reflection-style lookups beyond a
//! name match.

use super::RowValue;

/// Roles a field can play in column-driven stages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FieldRoles {
    /// Part of the identity/merge key.
    pub identity: bool,
    /// Part of the comparison set during merge classification.
    pub compare: bool,
    /// Part of the distinct fingerprint.
    pub distinct: bool,
}

/// One field of a typed row: a name, role flags, and get/set accessors.
pub struct Field<T> {
    name: &'static str,
    roles: FieldRoles,
    get: fn(&T) -> RowValue,
    set: Option<fn(&mut T, RowValue)>,
}

impl<T> Field<T> {
    /// Creates a read-only field.
    #[must_use]
    pub fn new(name: &'static str, get: fn(&T) -> RowValue) -> Self {
        Self {
            name,
            roles: FieldRoles::default(),
            get,
            set: None,
        }
    }

    /// Adds a setter, making the field writable.
    #[must_use]
    pub fn with_set(mut self, set: fn(&mut T, RowValue)) -> Self {
        self.set = Some(set);
        self
    }

    /// Marks the field as part of the identity key.
    #[must_use]
    pub fn identity(mut self) -> Self {
        self.roles.identity = true;
        self
    }

    /// Marks the field as a comparison column.
    #[must_use]
    pub fn compare(mut self) -> Self {
        self.roles.compare = true;
        self
    }

    /// Marks the field as part of the distinct fingerprint.
    #[must_use]
    pub fn distinct(mut self) -> Self {
        self.roles.distinct = true;
        self
    }

    /// Returns the field name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Returns the field roles.
    #[must_use]
    pub fn roles(&self) -> FieldRoles {
        self.roles
    }

    /// Reads the field from a row.
    #[must_use]
    pub fn get(&self, row: &T) -> RowValue {
        (self.get)(row)
    }

    /// Writes the field on a row. Returns false for read-only fields.
    pub fn set(&self, row: &mut T, value: RowValue) -> bool {
        match self.set {
            Some(set) => {
                set(row, value);
                true
            }
            None => false,
        }
    }
}

impl<T> std::fmt::Debug for Field<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Field")
            .field("name", &self.name)
            .field("roles", &self.roles)
            .finish()
    }
}

/// The compiled accessor table of a typed row.
#[derive(Debug)]
pub struct Schema<T> {
    fields: Vec<Field<T>>,
}

impl<T> Schema<T> {
    /// Starts building a schema.
    #[must_use]
    pub fn builder() -> SchemaBuilder<T> {
        SchemaBuilder { fields: Vec::new() }
    }

    /// Returns all fields in declaration order.
    #[must_use]
    pub fn fields(&self) -> &[Field<T>] {
        &self.fields
    }

    /// Finds a field by name.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&Field<T>> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Returns the names of identity-role fields.
    #[must_use]
    pub fn identity_columns(&self) -> Vec<String> {
        self.columns_with(|r| r.identity)
    }

    /// Returns the names of compare-role fields.
    #[must_use]
    pub fn compare_columns(&self) -> Vec<String> {
        self.columns_with(|r| r.compare)
    }

    /// Returns the names of distinct-role fields.
    #[must_use]
    pub fn distinct_columns(&self) -> Vec<String> {
        self.columns_with(|r| r.distinct)
    }

    /// Returns all field names in declaration order.
    #[must_use]
    pub fn column_names(&self) -> Vec<String> {
        self.fields.iter().map(|f| f.name.to_string()).collect()
    }

    fn columns_with(&self, want: impl Fn(FieldRoles) -> bool) -> Vec<String> {
        self.fields
            .iter()
            .filter(|f| want(f.roles))
            .map(|f| f.name.to_string())
            .collect()
    }
}

/// Builder for a [`Schema`].
pub struct SchemaBuilder<T> {
    fields: Vec<Field<T>>,
}

impl<T> SchemaBuilder<T> {
    /// Adds a field.
    #[must_use]
    pub fn field(mut self, field: Field<T>) -> Self {
        self.fields.push(field);
        self
    }

    /// Finishes the schema.
    #[must_use]
    pub fn build(self) -> Schema<T> {
        Schema { fields: self.fields }
    }
}

/// A statically-typed row with a compiled accessor table.
///
/// Implementors build the table once under a `OnceLock`:
///
/// ```rust,ignore
/// impl SchemaRow for Order {
///     fn schema() -> &'static Schema<Self> {
///         static SCHEMA: OnceLock<Schema<Order>> = OnceLock::new();
///         SCHEMA.get_or_init(|| {
///             Schema::builder()
///                 .field(Field::new("id", |r: &Order| r.id.into())
///                     .with_set(|r, v| r.id = v.as_int().unwrap_or_default())
///                     .identity())
///                 .field(Field::new("total", |r: &Order| r.total.into())
///                     .with_set(|r, v| r.total = v.as_float().unwrap_or_default())
///                     .compare())
///                 .build()
///         })
///     }
/// }
/// ```
pub trait SchemaRow: Sized + 'static {
    /// Returns the type's accessor table, built on first use.
    fn schema() -> &'static Schema<Self>;
}

/// Unified get/set access across all three row representations.
pub trait RowAccess {
    /// Returns the row's column names.
    fn columns(&self) -> Vec<String>;

    /// Reads a column by name. `None` means the column is unknown.
    fn get(&self, column: &str) -> Option<RowValue>;

    /// Writes a column by name. Returns false if the column is unknown
    /// or read-only.
    fn set(&mut self, column: &str, value: RowValue) -> bool;
}

impl<T: SchemaRow> RowAccess for T {
    fn columns(&self) -> Vec<String> {
        T::schema().column_names()
    }

    fn get(&self, column: &str) -> Option<RowValue> {
        T::schema().field(column).map(|f| f.get(self))
    }

    fn set(&mut self, column: &str, value: RowValue) -> bool {
        T::schema().field(column).is_some_and(|f| f.set(self, value))
    }
}
