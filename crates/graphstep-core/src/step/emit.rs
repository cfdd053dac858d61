//! Regeneration of the instance table from a product tree.
//!
//! Identifiers are assigned in a single pre-order pass: shared contexts
//! first, then for every node its product entities, payload, origin and
//! child frames, representation, and finally each child followed by the
//! occurrence that places it.

use std::collections::HashMap;

use super::document::{ProductNode, ShapePayload, StepDocument};
use super::entity::{Entity, EntityBody, EntityId, Record, Value};
use super::placement::Placement;

/// Ids a parent needs to reference a child.
struct Emitted {
    definition: EntityId,
    representation: EntityId,
    origin: EntityId,
}

struct Emitter {
    entities: Vec<Entity>,
    next: u64,
    occurrences: u64,
    product_context: EntityId,
    definition_context: EntityId,
}

fn text(s: &str) -> Value {
    Value::String(s.to_string())
}

fn reference(id: EntityId) -> Value {
    Value::Reference(id)
}

fn reals(values: &[f64; 3]) -> Value {
    Value::List(values.iter().map(|v| Value::Real(*v)).collect())
}

/// Emit the instance table for `doc` in deterministic order.
pub fn emit_document(doc: &StepDocument) -> Vec<Entity> {
    let mut emitter = Emitter {
        entities: Vec::new(),
        next: 1,
        occurrences: 0,
        product_context: EntityId(0),
        definition_context: EntityId(0),
    };

    let application = emitter.push(Record::new(
        "APPLICATION_CONTEXT",
        vec![text("core data for automotive mechanical design processes")],
    ));
    emitter.push(Record::new(
        "APPLICATION_PROTOCOL_DEFINITION",
        vec![
            text("international standard"),
            text("automotive_design"),
            Value::Integer(2000),
            reference(application),
        ],
    ));
    emitter.product_context = emitter.push(Record::new(
        "PRODUCT_CONTEXT",
        vec![text(""), reference(application), text("mechanical")],
    ));
    emitter.definition_context = emitter.push(Record::new(
        "PRODUCT_DEFINITION_CONTEXT",
        vec![text("part definition"), reference(application), text("design")],
    ));

    emitter.node(&doc.root);
    emitter.entities
}

impl Emitter {
    fn allocate(&mut self) -> EntityId {
        let id = EntityId(self.next);
        self.next += 1;
        id
    }

    fn push(&mut self, record: Record) -> EntityId {
        let id = self.allocate();
        self.entities.push(Entity::simple(id, record));
        id
    }

    fn push_complex(&mut self, records: Vec<Record>) -> EntityId {
        let id = self.allocate();
        self.entities.push(Entity {
            id,
            body: EntityBody::Complex(records),
        });
        id
    }

    fn placement(&mut self, placement: &Placement) -> EntityId {
        let point = self.push(Record::new("CARTESIAN_POINT", vec![text(""), reals(&placement.location)]));
        let axis = self.push(Record::new("DIRECTION", vec![text(""), reals(&placement.axis)]));
        let ref_direction = self.push(Record::new("DIRECTION", vec![text(""), reals(&placement.ref_direction)]));
        self.push(Record::new(
            "AXIS2_PLACEMENT_3D",
            vec![text(""), reference(point), reference(axis), reference(ref_direction)],
        ))
    }

    /// Copy payload entities with fresh ids; returns the local → global map.
    fn payload(&mut self, payload: &ShapePayload) -> HashMap<EntityId, EntityId> {
        let mut ids = HashMap::with_capacity(payload.entities.len());
        for entity in payload.entities.iter() {
            let id = self.allocate();
            ids.insert(entity.id, id);
        }
        let global = |id: EntityId| ids.get(&id).copied().unwrap_or(id);
        for entity in payload.entities.iter() {
            let mut copy = entity.clone();
            copy.id = global(entity.id);
            copy.remap_references(&global);
            self.entities.push(copy);
        }
        ids
    }

    fn node(&mut self, node: &ProductNode) -> Emitted {
        let product = self.push(Record::new(
            "PRODUCT",
            vec![
                text(&node.product_id),
                text(&node.name),
                text(&node.description),
                Value::List(vec![reference(self.product_context)]),
            ],
        ));
        self.push(Record::new(
            "PRODUCT_RELATED_PRODUCT_CATEGORY",
            vec![text("part"), Value::Unset, Value::List(vec![reference(product)])],
        ));
        let formation = self.push(Record::new(
            "PRODUCT_DEFINITION_FORMATION",
            vec![text(""), text(""), reference(product)],
        ));
        let definition = self.push(Record::new(
            "PRODUCT_DEFINITION",
            vec![
                text("design"),
                text(""),
                reference(formation),
                reference(self.definition_context),
            ],
        ));
        let definition_shape = self.push(Record::new(
            "PRODUCT_DEFINITION_SHAPE",
            vec![text(""), text(""), reference(definition)],
        ));

        let fallback;
        let payload = match &node.shape {
            Some(payload) => payload,
            None => {
                fallback = ShapePayload::default_context();
                &fallback
            }
        };
        let ids = self.payload(payload);
        let global = |id: EntityId| ids.get(&id).copied().unwrap_or(id);

        let origin = self.placement(&Placement::IDENTITY);
        let frames: Vec<EntityId> = node.children.iter().map(|c| self.placement(&c.placement)).collect();

        let mut items = vec![reference(origin)];
        items.extend(frames.iter().map(|f| reference(*f)));
        items.extend(payload.items.iter().map(|i| reference(global(*i))));
        let context = payload.context.map_or(Value::Unset, |c| reference(global(c)));
        let representation = self.push(Record::new(
            payload.representation.clone(),
            vec![text(&payload.representation_name), Value::List(items), context],
        ));
        self.push(Record::new(
            "SHAPE_DEFINITION_REPRESENTATION",
            vec![reference(definition_shape), reference(representation)],
        ));
        for linked in &payload.linked {
            self.push(Record::new(
                "SHAPE_REPRESENTATION_RELATIONSHIP",
                vec![text(""), text(""), reference(representation), reference(global(*linked))],
            ));
        }

        for (child, frame) in node.children.iter().zip(frames) {
            let emitted = self.node(child);
            self.occurrence(definition, representation, frame, &emitted);
        }

        Emitted {
            definition,
            representation,
            origin,
        }
    }

    fn occurrence(&mut self, parent: EntityId, parent_rep: EntityId, frame: EntityId, child: &Emitted) {
        self.occurrences += 1;
        let nauo = self.push(Record::new(
            "NEXT_ASSEMBLY_USAGE_OCCURRENCE",
            vec![
                text(&format!("NAUO{}", self.occurrences)),
                text(""),
                text(""),
                reference(parent),
                reference(child.definition),
                Value::Unset,
            ],
        ));
        let shape = self.push(Record::new(
            "PRODUCT_DEFINITION_SHAPE",
            vec![text("Placement"), text("Placement of an item"), reference(nauo)],
        ));
        let transformation = self.push(Record::new(
            "ITEM_DEFINED_TRANSFORMATION",
            vec![text(""), text(""), reference(child.origin), reference(frame)],
        ));
        let relation = self.push_complex(vec![
            Record::new(
                "REPRESENTATION_RELATIONSHIP",
                vec![text(""), text(""), reference(child.representation), reference(parent_rep)],
            ),
            Record::new(
                "REPRESENTATION_RELATIONSHIP_WITH_TRANSFORMATION",
                vec![reference(transformation)],
            ),
            Record::new("SHAPE_REPRESENTATION_RELATIONSHIP", vec![]),
        ]);
        self.push(Record::new(
            "CONTEXT_DEPENDENT_SHAPE_REPRESENTATION",
            vec![reference(relation), reference(shape)],
        ));
    }
}
