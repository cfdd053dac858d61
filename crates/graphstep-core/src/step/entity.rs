//! Entity-level model of an exchange file: instances, records and values.

use indexmap::IndexMap;
use std::fmt;

/// Instance name of an entity (`#42` → `EntityId(42)`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(pub u64);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A single attribute value of a record.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Integer(i64),
    Real(f64),
    String(String),
    /// `.NAME.`
    Enumeration(String),
    /// `"0FF"`
    Binary(String),
    Reference(EntityId),
    List(Vec<Value>),
    /// `LENGTH_MEASURE(1.E-07)`
    Typed { keyword: String, value: Box<Value> },
    /// `$`
    Unset,
    /// `*`
    Derived,
}

impl Value {
    pub fn as_reference(&self) -> Option<EntityId> {
        match self {
            Value::Reference(id) => Some(*id),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Real(r) => Some(*r),
            Value::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    /// Visit every reference contained in this value, depth first.
    pub fn for_each_reference(&self, f: &mut impl FnMut(EntityId)) {
        match self {
            Value::Reference(id) => f(*id),
            Value::List(items) => items.iter().for_each(|v| v.for_each_reference(f)),
            Value::Typed { value, .. } => value.for_each_reference(f),
            _ => {}
        }
    }

    /// Rewrite every reference through `map`.
    pub fn remap_references(&mut self, map: &impl Fn(EntityId) -> EntityId) {
        match self {
            Value::Reference(id) => *id = map(*id),
            Value::List(items) => items.iter_mut().for_each(|v| v.remap_references(map)),
            Value::Typed { value, .. } => value.remap_references(map),
            _ => {}
        }
    }
}

/// `KEYWORD(param, param, ...)`
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub keyword: String,
    pub params: Vec<Value>,
}

impl Record {
    pub fn new(keyword: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            keyword: keyword.into(),
            params,
        }
    }

    pub fn param(&self, index: usize) -> Option<&Value> {
        self.params.get(index)
    }

    pub fn reference(&self, index: usize) -> Option<EntityId> {
        self.param(index).and_then(Value::as_reference)
    }

    pub fn string(&self, index: usize) -> Option<&str> {
        self.param(index).and_then(Value::as_str)
    }

    /// References held by a list parameter, in order.
    pub fn reference_list(&self, index: usize) -> Vec<EntityId> {
        self.param(index)
            .and_then(Value::as_list)
            .map(|items| items.iter().filter_map(Value::as_reference).collect())
            .unwrap_or_default()
    }
}

/// Body of an instance: either one record or a complex (multi-record) instance.
#[derive(Debug, Clone, PartialEq)]
pub enum EntityBody {
    Simple(Record),
    Complex(Vec<Record>),
}

/// One instance of the DATA section.
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    pub id: EntityId,
    pub body: EntityBody,
}

impl Entity {
    pub fn simple(id: EntityId, record: Record) -> Self {
        Self {
            id,
            body: EntityBody::Simple(record),
        }
    }

    pub fn records(&self) -> &[Record] {
        match &self.body {
            EntityBody::Simple(record) => std::slice::from_ref(record),
            EntityBody::Complex(records) => records,
        }
    }

    fn records_mut(&mut self) -> &mut [Record] {
        match &mut self.body {
            EntityBody::Simple(record) => std::slice::from_mut(record),
            EntityBody::Complex(records) => records,
        }
    }

    /// Keyword of a simple instance; `None` for complex instances.
    pub fn keyword(&self) -> Option<&str> {
        match &self.body {
            EntityBody::Simple(record) => Some(&record.keyword),
            EntityBody::Complex(_) => None,
        }
    }

    /// Type tag used in diagnostics; complex instances join their keywords.
    pub fn type_tag(&self) -> String {
        match &self.body {
            EntityBody::Simple(record) => record.keyword.clone(),
            EntityBody::Complex(records) => records
                .iter()
                .map(|r| r.keyword.as_str())
                .collect::<Vec<_>>()
                .join("+"),
        }
    }

    /// Find the record with the given keyword (simple or part of a complex instance).
    pub fn record(&self, keyword: &str) -> Option<&Record> {
        self.records().iter().find(|r| r.keyword == keyword)
    }

    pub fn is(&self, keyword: &str) -> bool {
        self.record(keyword).is_some()
    }

    /// All references held by this instance, in attribute order.
    pub fn references(&self) -> Vec<EntityId> {
        let mut refs = Vec::new();
        for record in self.records() {
            for param in &record.params {
                param.for_each_reference(&mut |id| refs.push(id));
            }
        }
        refs
    }

    pub fn remap_references(&mut self, map: &impl Fn(EntityId) -> EntityId) {
        for record in self.records_mut() {
            for param in &mut record.params {
                param.remap_references(map);
            }
        }
    }
}

/// Flat instance table in file order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityTable {
    entities: IndexMap<EntityId, Entity>,
}

impl EntityTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an entity; returns the previous one with the same id, if any.
    pub fn insert(&mut self, entity: Entity) -> Option<Entity> {
        self.entities.insert(entity.id, entity)
    }

    pub fn get(&self, id: EntityId) -> Option<&Entity> {
        self.entities.get(&id)
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.entities.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    /// Entities carrying a record with `keyword`, in file order.
    pub fn with_keyword<'a>(&'a self, keyword: &'a str) -> impl Iterator<Item = &'a Entity> + 'a {
        self.entities.values().filter(move |e| e.is(keyword))
    }

    /// Lookup of a record by id and keyword.
    pub fn record(&self, id: EntityId, keyword: &str) -> Option<&Record> {
        self.get(id).and_then(|e| e.record(keyword))
    }

    /// Next free instance id.
    pub fn next_id(&self) -> EntityId {
        EntityId(self.entities.keys().map(|id| id.0).max().unwrap_or(0) + 1)
    }
}

impl FromIterator<Entity> for EntityTable {
    fn from_iter<T: IntoIterator<Item = Entity>>(iter: T) -> Self {
        let mut table = EntityTable::new();
        for entity in iter {
            table.insert(entity);
        }
        table
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_complex_record_lookup() {
        let entity = Entity {
            id: EntityId(7),
            body: EntityBody::Complex(vec![
                Record::new("REPRESENTATION_RELATIONSHIP", vec![
                    Value::String(String::new()),
                    Value::String(String::new()),
                    Value::Reference(EntityId(1)),
                    Value::Reference(EntityId(2)),
                ]),
                Record::new(
                    "REPRESENTATION_RELATIONSHIP_WITH_TRANSFORMATION",
                    vec![Value::Reference(EntityId(3))],
                ),
            ]),
        };

        assert!(entity.keyword().is_none());
        assert!(entity.is("REPRESENTATION_RELATIONSHIP_WITH_TRANSFORMATION"));
        assert_eq!(entity.references(), vec![EntityId(1), EntityId(2), EntityId(3)]);
        assert_eq!(
            entity.type_tag(),
            "REPRESENTATION_RELATIONSHIP+REPRESENTATION_RELATIONSHIP_WITH_TRANSFORMATION"
        );
    }

    #[test]
    fn test_remap_nested_references() {
        let mut entity = Entity::simple(
            EntityId(1),
            Record::new(
                "SHAPE_REPRESENTATION",
                vec![
                    Value::String("x".into()),
                    Value::List(vec![Value::Reference(EntityId(10)), Value::Reference(EntityId(11))]),
                    Value::Reference(EntityId(12)),
                ],
            ),
        );
        entity.remap_references(&|id| EntityId(id.0 + 100));
        assert_eq!(entity.references(), vec![EntityId(110), EntityId(111), EntityId(112)]);
    }
}
