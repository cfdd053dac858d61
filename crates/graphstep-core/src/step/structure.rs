//! Interpretation of an instance table as a product structure.
//!
//! Walks `PRODUCT_DEFINITION` / `NEXT_ASSEMBLY_USAGE_OCCURRENCE` to build the
//! tree, resolves occurrence placements from `ITEM_DEFINED_TRANSFORMATION`
//! and gathers everything else a node's shape representation references into
//! its opaque [`ShapePayload`].

use std::collections::{HashMap, HashSet, VecDeque};

use tracing::{debug, warn};

use super::document::{NodeKind, ProductNode, ShapePayload, StepDocument, StepHeader};
use super::entity::{Entity, EntityId, EntityTable, Record, Value};
use super::error::{Result, StepError};
use super::parser::ExchangeFile;
use super::placement::Placement;

/// Entities that position things; references between them may form chains.
const PLACEMENT_KEYWORDS: &[&str] = &[
    "AXIS1_PLACEMENT",
    "AXIS2_PLACEMENT_2D",
    "AXIS2_PLACEMENT_3D",
    "CARTESIAN_POINT",
    "DIRECTION",
];

/// Product-structure entities; never part of a shape payload.
const STRUCTURE_KEYWORDS: &[&str] = &[
    "APPLICATION_CONTEXT",
    "APPLICATION_PROTOCOL_DEFINITION",
    "CONTEXT_DEPENDENT_SHAPE_REPRESENTATION",
    "ITEM_DEFINED_TRANSFORMATION",
    "NEXT_ASSEMBLY_USAGE_OCCURRENCE",
    "PRODUCT",
    "PRODUCT_CATEGORY",
    "PRODUCT_CONTEXT",
    "PRODUCT_DEFINITION",
    "PRODUCT_DEFINITION_CONTEXT",
    "PRODUCT_DEFINITION_FORMATION",
    "PRODUCT_DEFINITION_FORMATION_WITH_SPECIFIED_SOURCE",
    "PRODUCT_DEFINITION_SHAPE",
    "PRODUCT_RELATED_PRODUCT_CATEGORY",
    "REPRESENTATION_RELATIONSHIP",
    "REPRESENTATION_RELATIONSHIP_WITH_TRANSFORMATION",
    "SHAPE_DEFINITION_REPRESENTATION",
];

/// Representation, context and unit entities understood by the codec.
const REPRESENTATION_KEYWORDS: &[&str] = &[
    "CONVERSION_BASED_UNIT",
    "DIMENSIONAL_EXPONENTS",
    "GEOMETRIC_REPRESENTATION_CONTEXT",
    "GLOBAL_UNCERTAINTY_ASSIGNED_CONTEXT",
    "GLOBAL_UNIT_ASSIGNED_CONTEXT",
    "LENGTH_MEASURE_WITH_UNIT",
    "LENGTH_UNIT",
    "NAMED_UNIT",
    "PLANE_ANGLE_MEASURE_WITH_UNIT",
    "PLANE_ANGLE_UNIT",
    "REPRESENTATION_CONTEXT",
    "SHAPE_REPRESENTATION",
    "SHAPE_REPRESENTATION_RELATIONSHIP",
    "SI_UNIT",
    "SOLID_ANGLE_UNIT",
    "UNCERTAINTY_MEASURE_WITH_UNIT",
];

fn has_keyword(entity: &Entity, set: &[&str]) -> bool {
    entity.records().iter().any(|r| set.contains(&r.keyword.as_str()))
}

fn is_placement(entity: &Entity) -> bool {
    has_keyword(entity, PLACEMENT_KEYWORDS)
}

fn is_structure(entity: &Entity) -> bool {
    has_keyword(entity, STRUCTURE_KEYWORDS)
}

/// Whether every record of the entity is in the recognized subset.
pub fn is_recognized(entity: &Entity) -> bool {
    entity.records().iter().all(|r| {
        let k = r.keyword.as_str();
        PLACEMENT_KEYWORDS.contains(&k) || STRUCTURE_KEYWORDS.contains(&k) || REPRESENTATION_KEYWORDS.contains(&k)
    })
}

/// Build a [`StepDocument`] from parsed exchange content.
pub fn build_document(file: ExchangeFile) -> Result<StepDocument> {
    let table = &file.data;
    validate_references(table)?;
    check_reference_cycles(table)?;

    let index = Index::build(table)?;
    let root_pd = index.root()?;

    let mut interpreter = Interpreter {
        table,
        index: &index,
        visited: HashSet::new(),
        quarantined: HashSet::new(),
        owners: Vec::new(),
        preorder: 0,
    };
    let mut root = interpreter.node(root_pd, Placement::IDENTITY, None)?;

    if let Some(unreached) = index.products.keys().find(|pd| !interpreter.visited.contains(*pd)) {
        return Err(StepError::malformed(
            *unreached,
            "product definition is part of an assembly cycle",
        ));
    }

    let attached = attach_unreached(table, &index, &interpreter.quarantined, &mut interpreter.owners, &mut root)?;

    let mut warnings = Vec::new();
    let mut dropped = 0usize;
    for entity in table.iter().filter(|e| !is_recognized(e)) {
        let kept = interpreter.quarantined.contains(&entity.id) || attached.contains(&entity.id);
        if !kept {
            dropped += 1;
        }
        debug!(entity = %entity.id, keyword = %entity.type_tag(), kept, "unsupported entity");
        warnings.push(StepError::UnsupportedEntity {
            entity: entity.id,
            keyword: entity.type_tag(),
        });
    }
    if !warnings.is_empty() {
        warn!(
            unsupported = warnings.len(),
            kept = warnings.len() - dropped,
            dropped,
            "entities outside the structural subset"
        );
    }

    Ok(StepDocument {
        header: StepHeader {
            records: file.header,
        },
        root,
        warnings,
    })
}

fn validate_references(table: &EntityTable) -> Result<()> {
    for entity in table.iter() {
        if let Some(missing) = entity.references().into_iter().find(|r| !table.contains(*r)) {
            return Err(StepError::malformed(
                entity.id,
                format!("unresolved reference {missing}"),
            ));
        }
    }
    Ok(())
}

/// Depth-first search over non-placement references.
fn check_reference_cycles(table: &EntityTable) -> Result<()> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Active,
        Done,
    }

    let mut marks: HashMap<EntityId, Mark> = HashMap::new();
    for start in table.iter() {
        if marks.contains_key(&start.id) || is_placement(start) {
            continue;
        }
        marks.insert(start.id, Mark::Active);
        let mut stack = vec![(start.id, start.references())];

        while let Some(top) = stack.last_mut() {
            let current = top.0;
            let Some(next) = top.1.pop() else {
                marks.insert(current, Mark::Done);
                stack.pop();
                continue;
            };
            let Some(entity) = table.get(next) else {
                continue;
            };
            if is_placement(entity) {
                continue;
            }
            match marks.get(&next) {
                Some(Mark::Active) => {
                    return Err(StepError::malformed(
                        next,
                        format!("reference cycle through {current}"),
                    ))
                }
                Some(Mark::Done) => {}
                None => {
                    marks.insert(next, Mark::Active);
                    stack.push((next, entity.references()));
                }
            }
        }
    }
    Ok(())
}

// ============================================================================
// Lookup tables
// ============================================================================

struct ProductInfo {
    product_id: String,
    name: String,
    description: String,
}

struct Occurrence {
    nauo: EntityId,
    child: EntityId,
}

/// Reverse lookups over the instance table, built in one pass.
struct Index {
    /// Product definitions in file order.
    products: indexmap::IndexMap<EntityId, ProductInfo>,
    children: HashMap<EntityId, Vec<Occurrence>>,
    parent: HashMap<EntityId, EntityId>,
    /// definition (product definition or occurrence) → PRODUCT_DEFINITION_SHAPE
    shape_of: HashMap<EntityId, EntityId>,
    /// PRODUCT_DEFINITION_SHAPE → representation
    rep_of_shape: HashMap<EntityId, EntityId>,
    /// PRODUCT_DEFINITION_SHAPE of an occurrence → representation relationship
    transform_of_shape: HashMap<EntityId, EntityId>,
    /// Plain `SHAPE_REPRESENTATION_RELATIONSHIP` pairs.
    rep_links: Vec<(EntityId, EntityId)>,
}

fn string_param(record: &Record, index: usize) -> String {
    record.string(index).unwrap_or_default().to_string()
}

fn required_ref(entity: &Entity, record: &Record, index: usize) -> Result<EntityId> {
    record.reference(index).ok_or_else(|| {
        StepError::malformed(
            entity.id,
            format!("{} attribute {} must be a reference", record.keyword, index + 1),
        )
    })
}

impl Index {
    fn build(table: &EntityTable) -> Result<Self> {
        let mut index = Index {
            products: indexmap::IndexMap::new(),
            children: HashMap::new(),
            parent: HashMap::new(),
            shape_of: HashMap::new(),
            rep_of_shape: HashMap::new(),
            transform_of_shape: HashMap::new(),
            rep_links: Vec::new(),
        };

        for entity in table.iter() {
            if let Some(pd) = entity.record("PRODUCT_DEFINITION") {
                let info = Self::product_info(table, entity, pd)?;
                index.products.insert(entity.id, info);
            }
            if let Some(pds) = entity.record("PRODUCT_DEFINITION_SHAPE") {
                let definition = required_ref(entity, pds, 2)?;
                index.shape_of.entry(definition).or_insert(entity.id);
            }
            if let Some(sdr) = entity.record("SHAPE_DEFINITION_REPRESENTATION") {
                let definition = required_ref(entity, sdr, 0)?;
                let rep = required_ref(entity, sdr, 1)?;
                index.rep_of_shape.entry(definition).or_insert(rep);
            }
            if let Some(cdsr) = entity.record("CONTEXT_DEPENDENT_SHAPE_REPRESENTATION") {
                let relation = required_ref(entity, cdsr, 0)?;
                let shape = required_ref(entity, cdsr, 1)?;
                index.transform_of_shape.entry(shape).or_insert(relation);
            }
            if entity.keyword() == Some("SHAPE_REPRESENTATION_RELATIONSHIP") {
                if let Some(srr) = entity.record("SHAPE_REPRESENTATION_RELATIONSHIP") {
                    let rep_1 = required_ref(entity, srr, 2)?;
                    let rep_2 = required_ref(entity, srr, 3)?;
                    index.rep_links.push((rep_1, rep_2));
                }
            }
        }

        if index.products.is_empty() {
            return Err(StepError::malformed_file("no PRODUCT_DEFINITION found"));
        }

        for entity in table.with_keyword("NEXT_ASSEMBLY_USAGE_OCCURRENCE") {
            let Some(nauo) = entity.record("NEXT_ASSEMBLY_USAGE_OCCURRENCE") else {
                continue;
            };
            let relating = required_ref(entity, nauo, 3)?;
            let related = required_ref(entity, nauo, 4)?;
            for pd in [relating, related] {
                if !index.products.contains_key(&pd) {
                    return Err(StepError::malformed(
                        entity.id,
                        format!("{pd} is not a PRODUCT_DEFINITION"),
                    ));
                }
            }
            if let Some(previous) = index.parent.insert(related, relating) {
                return Err(StepError::malformed(
                    related,
                    format!("product definition has more than one parent ({previous} and {relating})"),
                ));
            }
            index.children.entry(relating).or_default().push(Occurrence {
                nauo: entity.id,
                child: related,
            });
        }

        Ok(index)
    }

    fn product_info(table: &EntityTable, entity: &Entity, pd: &Record) -> Result<ProductInfo> {
        let formation_id = required_ref(entity, pd, 2)?;
        let formation = table
            .get(formation_id)
            .and_then(|e| {
                e.records()
                    .iter()
                    .find(|r| r.keyword.starts_with("PRODUCT_DEFINITION_FORMATION"))
            })
            .ok_or_else(|| {
                StepError::malformed(entity.id, format!("{formation_id} is not a PRODUCT_DEFINITION_FORMATION"))
            })?;
        let product_id = formation.reference(2).ok_or_else(|| {
            StepError::malformed(formation_id, "formation does not reference a PRODUCT")
        })?;
        let product = table
            .record(product_id, "PRODUCT")
            .ok_or_else(|| StepError::malformed(formation_id, format!("{product_id} is not a PRODUCT")))?;

        let id = string_param(product, 0);
        let name = match product.string(1) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => id.clone(),
        };
        Ok(ProductInfo {
            product_id: id,
            name,
            description: string_param(product, 2),
        })
    }

    fn root(&self) -> Result<EntityId> {
        let roots: Vec<EntityId> = self
            .products
            .keys()
            .filter(|pd| !self.parent.contains_key(*pd))
            .copied()
            .collect();
        match roots.as_slice() {
            [root] => Ok(*root),
            [] => Err(StepError::malformed_file("product structure has no root (assembly cycle)")),
            [first, ..] => Err(StepError::malformed(
                *first,
                format!("product structure has {} top-level products", roots.len()),
            )),
        }
    }

    fn representation(&self, definition: EntityId) -> Option<EntityId> {
        self.shape_of
            .get(&definition)
            .and_then(|pds| self.rep_of_shape.get(pds))
            .copied()
    }
}

// ============================================================================
// Tree construction
// ============================================================================

/// Occurrence transform resolved against the child's representation.
struct Transform {
    child_item: EntityId,
    parent_item: EntityId,
    placement: Placement,
}

/// File-id to payload-local-id map of one node's payload.
struct Owner {
    /// Pre-order position of the node in the tree.
    node: usize,
    local: HashMap<EntityId, EntityId>,
}

struct Interpreter<'a> {
    table: &'a EntityTable,
    index: &'a Index,
    visited: HashSet<EntityId>,
    /// Entities carried inside some shape payload.
    quarantined: HashSet<EntityId>,
    /// Payloads in pre-order.
    owners: Vec<Owner>,
    preorder: usize,
}

impl<'a> Interpreter<'a> {
    fn node(&mut self, pd: EntityId, placement: Placement, origin: Option<EntityId>) -> Result<ProductNode> {
        let index = self.index;
        self.visited.insert(pd);
        let order = self.preorder;
        self.preorder += 1;
        let info = index
            .products
            .get(&pd)
            .ok_or_else(|| StepError::malformed(pd, "not a PRODUCT_DEFINITION"))?;
        let rep = index.representation(pd);

        let occurrences = index.children.get(&pd).map(Vec::as_slice).unwrap_or_default();
        let mut child_transforms = Vec::with_capacity(occurrences.len());
        for occurrence in occurrences {
            let child_rep = index.representation(occurrence.child);
            child_transforms.push(self.transform(occurrence, child_rep)?);
        }

        let shape = match rep {
            Some(rep) => {
                let frames: Vec<EntityId> = child_transforms.iter().flatten().map(|t| t.parent_item).collect();
                let (payload, local) = self.payload(rep, origin, &frames)?;
                self.owners.push(Owner { node: order, local });
                Some(payload)
            }
            None => None,
        };

        let mut children = Vec::with_capacity(occurrences.len());
        for (occurrence, transform) in occurrences.iter().zip(child_transforms) {
            let (placement, child_origin) = match transform {
                Some(t) => (t.placement, Some(t.child_item)),
                None => (Placement::IDENTITY, None),
            };
            children.push(self.node(occurrence.child, placement, child_origin)?);
        }

        Ok(ProductNode {
            product_id: info.product_id.clone(),
            name: info.name.clone(),
            description: info.description.clone(),
            kind: if children.is_empty() {
                NodeKind::Part
            } else {
                NodeKind::Assembly
            },
            placement,
            shape,
            children,
        })
    }

    /// Resolve the occurrence's `ITEM_DEFINED_TRANSFORMATION`, if any.
    fn transform(&self, occurrence: &Occurrence, child_rep: Option<EntityId>) -> Result<Option<Transform>> {
        let Some(relation_id) = self
            .index
            .shape_of
            .get(&occurrence.nauo)
            .and_then(|pds| self.index.transform_of_shape.get(pds))
            .copied()
        else {
            return Ok(None);
        };
        let relation = self
            .table
            .get(relation_id)
            .ok_or_else(|| StepError::malformed(relation_id, "missing representation relationship"))?;
        let Some(rr) = relation.record("REPRESENTATION_RELATIONSHIP") else {
            return Err(StepError::malformed(relation_id, "expected REPRESENTATION_RELATIONSHIP"));
        };
        let Some(rrwt) = relation.record("REPRESENTATION_RELATIONSHIP_WITH_TRANSFORMATION") else {
            return Err(StepError::malformed(relation_id, "relationship carries no transformation"));
        };
        let idt_id = required_ref(relation, rrwt, 0)?;
        let idt = self
            .table
            .record(idt_id, "ITEM_DEFINED_TRANSFORMATION")
            .ok_or_else(|| StepError::malformed(idt_id, "expected ITEM_DEFINED_TRANSFORMATION"))?;
        let idt_entity = self
            .table
            .get(idt_id)
            .ok_or_else(|| StepError::malformed(idt_id, "missing transformation"))?;
        let item_1 = required_ref(idt_entity, idt, 2)?;
        let item_2 = required_ref(idt_entity, idt, 3)?;

        // rep_1 is normally the child; some writers swap the pair.
        let flipped = child_rep.is_some() && rr.reference(3) == child_rep && rr.reference(2) != child_rep;
        let (child_item, parent_item) = if flipped { (item_2, item_1) } else { (item_1, item_2) };

        let child_frame = self.placement(child_item)?;
        let parent_frame = self.placement(parent_item)?;
        let placement = if child_frame.is_identity() {
            parent_frame
        } else {
            parent_frame.compose(&child_frame.inverse())
        };

        Ok(Some(Transform {
            child_item,
            parent_item,
            placement,
        }))
    }

    fn placement(&self, id: EntityId) -> Result<Placement> {
        let axis2 = self
            .table
            .record(id, "AXIS2_PLACEMENT_3D")
            .ok_or_else(|| StepError::malformed(id, "expected AXIS2_PLACEMENT_3D"))?;
        let location = match axis2.reference(1) {
            Some(point) => self.coordinates(point, "CARTESIAN_POINT")?,
            None => return Err(StepError::malformed(id, "placement has no location")),
        };
        let axis = axis2
            .reference(2)
            .map(|d| self.coordinates(d, "DIRECTION"))
            .transpose()?;
        let ref_direction = axis2
            .reference(3)
            .map(|d| self.coordinates(d, "DIRECTION"))
            .transpose()?;
        Ok(Placement::new(location, axis, ref_direction))
    }

    fn coordinates(&self, id: EntityId, keyword: &str) -> Result<[f64; 3]> {
        let record = self
            .table
            .record(id, keyword)
            .ok_or_else(|| StepError::malformed(id, format!("expected {keyword}")))?;
        let values = record
            .param(1)
            .and_then(Value::as_list)
            .ok_or_else(|| StepError::malformed(id, "missing coordinate list"))?;
        let mut out = [0.0; 3];
        for (slot, value) in out.iter_mut().zip(values) {
            *slot = value
                .as_f64()
                .ok_or_else(|| StepError::malformed(id, "non-numeric coordinate"))?;
        }
        Ok(out)
    }

    /// Split a representation into structural placements and opaque payload.
    fn payload(
        &mut self,
        rep: EntityId,
        origin: Option<EntityId>,
        frames: &[EntityId],
    ) -> Result<(ShapePayload, HashMap<EntityId, EntityId>)> {
        let entity = self
            .table
            .get(rep)
            .ok_or_else(|| StepError::malformed(rep, "missing shape representation"))?;
        let record = entity
            .records()
            .iter()
            .find(|r| r.params.len() >= 3 && r.param(1).and_then(Value::as_list).is_some())
            .ok_or_else(|| StepError::malformed(rep, "expected a representation (name, items, context)"))?;

        let items = record.reference_list(1);
        let context = record.reference(2);
        let origin = origin.or_else(|| {
            items
                .iter()
                .copied()
                .find(|i| !frames.contains(i) && self.table.record(*i, "AXIS2_PLACEMENT_3D").is_some())
        });
        let geometry: Vec<EntityId> = items
            .into_iter()
            .filter(|i| Some(*i) != origin && !frames.contains(i))
            .collect();

        let product_reps: HashSet<EntityId> = self.index.rep_of_shape.values().copied().collect();
        let linked: Vec<EntityId> = self
            .index
            .rep_links
            .iter()
            .filter_map(|&(a, b)| match (a == rep, b == rep) {
                (true, false) => Some(b),
                (false, true) => Some(a),
                _ => None,
            })
            .filter(|other| !product_reps.contains(other))
            .collect();

        // Closure over everything the payload roots reference.
        let mut reached = HashSet::new();
        let mut queue: VecDeque<EntityId> = geometry.iter().chain(context.iter()).chain(linked.iter()).copied().collect();
        while let Some(id) = queue.pop_front() {
            let Some(entity) = self.table.get(id) else {
                continue;
            };
            if is_structure(entity) || !reached.insert(id) {
                continue;
            }
            queue.extend(entity.references());
        }
        self.quarantined.extend(reached.iter().copied());

        let mut local_ids = HashMap::new();
        let mut entities = EntityTable::new();
        for (n, entity) in self.table.iter().filter(|e| reached.contains(&e.id)).enumerate() {
            local_ids.insert(entity.id, EntityId(n as u64 + 1));
        }
        let local = |id: EntityId| local_ids.get(&id).copied().unwrap_or(id);
        for entity in self.table.iter().filter(|e| reached.contains(&e.id)) {
            let mut copy = entity.clone();
            copy.id = local(entity.id);
            copy.remap_references(&local);
            entities.insert(copy);
        }

        let payload = ShapePayload {
            representation: record.keyword.clone(),
            representation_name: string_param(record, 0),
            items: geometry.iter().map(|i| local(*i)).collect(),
            context: context.map(local),
            linked: linked.iter().map(|i| local(*i)).collect(),
            entities,
        };
        Ok((payload, local_ids))
    }
}

// ============================================================================
// Unreached entities
// ============================================================================

/// Attach unsupported entities that no shape representation reaches
/// (styling, colours, layer assignments, ...) to a payload.
///
/// Each group of such entities, linked by references among themselves, goes
/// to the first payload in pre-order holding everything the group points
/// at. When no payload holds all of it, the first one holding any of it
/// receives copies of the rest; a group that points at nothing goes to the
/// first payload, or to a context-only root payload. Groups that reference
/// product-structure instances are dropped, since the structure is
/// regenerated on output. Returns the ids that were attached.
fn attach_unreached(
    table: &EntityTable,
    index: &Index,
    quarantined: &HashSet<EntityId>,
    owners: &mut Vec<Owner>,
    root: &mut ProductNode,
) -> Result<HashSet<EntityId>> {
    let product_reps: HashSet<EntityId> = index.rep_of_shape.values().copied().collect();
    let fixed = |entity: &Entity| is_structure(entity) || product_reps.contains(&entity.id);

    let mut members = HashSet::new();
    let mut queue: VecDeque<EntityId> = table
        .iter()
        .filter(|e| !is_recognized(e) && !quarantined.contains(&e.id))
        .map(|e| e.id)
        .collect();
    while let Some(id) = queue.pop_front() {
        let Some(entity) = table.get(id) else {
            continue;
        };
        if quarantined.contains(&id) || fixed(entity) || !members.insert(id) {
            continue;
        }
        queue.extend(entity.references());
    }
    if members.is_empty() {
        return Ok(HashSet::new());
    }

    // Union-find over references between members.
    let mut parent: HashMap<EntityId, EntityId> = members.iter().map(|id| (*id, *id)).collect();
    fn find(parent: &HashMap<EntityId, EntityId>, mut id: EntityId) -> EntityId {
        while let Some(&up) = parent.get(&id) {
            if up == id {
                break;
            }
            id = up;
        }
        id
    }
    let position: HashMap<EntityId, usize> = table.iter().enumerate().map(|(n, e)| (e.id, n)).collect();
    let mut groups: indexmap::IndexMap<EntityId, Vec<EntityId>> = indexmap::IndexMap::new();
    for entity in table.iter().filter(|e| members.contains(&e.id)) {
        for reference in entity.references() {
            if members.contains(&reference) {
                let (a, b) = (find(&parent, entity.id), find(&parent, reference));
                if a != b {
                    parent.insert(a, b);
                }
            }
        }
    }
    for entity in table.iter().filter(|e| members.contains(&e.id)) {
        groups.entry(find(&parent, entity.id)).or_default().push(entity.id);
    }

    let mut attached = HashSet::new();
    for group in groups.into_values() {
        let mut anchors = Vec::new();
        let mut blocked = false;
        for id in &group {
            for reference in table.get(*id).map(Entity::references).unwrap_or_default() {
                if members.contains(&reference) {
                    continue;
                }
                if quarantined.contains(&reference) {
                    if !anchors.contains(&reference) {
                        anchors.push(reference);
                    }
                } else {
                    blocked = true;
                }
            }
        }
        if blocked {
            debug!(first = %group[0], entities = group.len(), "unreached group references product structure");
            continue;
        }

        let target = owners
            .iter()
            .position(|o| anchors.iter().all(|a| o.local.contains_key(a)))
            .or_else(|| owners.iter().position(|o| anchors.iter().any(|a| o.local.contains_key(a))));
        let target = match target {
            Some(target) => target,
            None => {
                root.shape = Some(ShapePayload::default_context());
                owners.insert(
                    0,
                    Owner {
                        node: 0,
                        local: HashMap::new(),
                    },
                );
                0
            }
        };
        let owner = &mut owners[target];
        let node = preorder_mut(root, owner.node, &mut 0)
            .ok_or_else(|| StepError::malformed_file("payload owner missing from the product tree"))?;
        let payload = node
            .shape
            .as_mut()
            .ok_or_else(|| StepError::malformed_file("payload owner has no shape"))?;

        // Anchors held only by other payloads come along as copies.
        let mut copies = HashSet::new();
        let mut pending: VecDeque<EntityId> = anchors.iter().filter(|a| !owner.local.contains_key(a)).copied().collect();
        while let Some(id) = pending.pop_front() {
            let Some(entity) = table.get(id) else {
                continue;
            };
            if owner.local.contains_key(&id) || is_structure(entity) || !copies.insert(id) {
                continue;
            }
            pending.extend(entity.references());
        }

        let mut incoming: Vec<EntityId> = group.iter().copied().chain(copies).collect();
        incoming.sort_by_key(|id| position.get(id).copied().unwrap_or(usize::MAX));
        let mut next = payload.entities.iter().map(|e| e.id.0).max().unwrap_or(0) + 1;
        for id in &incoming {
            owner.local.insert(*id, EntityId(next));
            next += 1;
        }
        let local = |id: EntityId| owner.local.get(&id).copied().unwrap_or(id);
        for id in &incoming {
            if let Some(entity) = table.get(*id) {
                let mut copy = entity.clone();
                copy.id = local(entity.id);
                copy.remap_references(&local);
                payload.entities.insert(copy);
            }
        }
        attached.extend(group);
    }
    Ok(attached)
}

fn preorder_mut<'n>(node: &'n mut ProductNode, target: usize, seen: &mut usize) -> Option<&'n mut ProductNode> {
    if *seen == target {
        return Some(node);
    }
    *seen += 1;
    for child in &mut node.children {
        if let Some(found) = preorder_mut(child, target, seen) {
            return Some(found);
        }
    }
    None
}
