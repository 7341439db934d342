//! Entries are the unit of storage. An [`Entry`] is an identified, named,
//! ordered list of attributes, each holding presentation and normalised value
//! forms. The per-modification value operations (add, delete, replace,
//! increment, soft-add) live here - they mutate a working entry in place and
//! are all-or-nothing per modification.
//!
//! Duplicating an entry's attribute list is shallow: the containers are
//! cloned, the value bytes are shared. Restoring a saved attribute list is a
//! vector swap.

use std::collections::BTreeMap;

use crate::modify::Modify;
use crate::prelude::*;

// Cached objectClass derivations. Invalidated whenever objectClass or
// structuralObjectClass changes.
const OCF_CHECKED: u32 = 0x01;
const OCF_GLUE: u32 = 0x02;
const OCF_REFERRAL: u32 = 0x04;

/// One attribute of an entry: a normalised description and its values in
/// presentation order.
#[derive(Debug, Clone, PartialEq)]
pub struct Attr {
    pub name: AttrString,
    pub vals: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    id: u64,
    dn: String,
    ndn: String,
    attrs: Vec<Attr>,
    ocflags: u32,
}

impl Entry {
    pub fn new(id: u64, dn: &str) -> Self {
        Entry {
            id,
            dn: dn.to_string(),
            ndn: dn_normalise(dn),
            attrs: Vec::new(),
            ocflags: 0,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn dn(&self) -> &str {
        &self.dn
    }

    pub fn ndn(&self) -> &str {
        &self.ndn
    }

    pub fn attrs(&self) -> &[Attr] {
        &self.attrs
    }

    pub fn attr_find(&self, name: &str) -> Option<&Attr> {
        self.attrs.iter().find(|a| a.name.as_str() == name)
    }

    fn attr_find_mut(&mut self, name: &str) -> Option<&mut Attr> {
        self.attrs.iter_mut().find(|a| a.name.as_str() == name)
    }

    fn attr_remove(&mut self, name: &str) -> Option<Attr> {
        let pos = self.attrs.iter().position(|a| a.name.as_str() == name)?;
        Some(self.attrs.remove(pos))
    }

    /// Append a value to an attribute, creating the attribute if needed. Used
    /// when building entries - the value engine has its own duplicate rules.
    pub fn add_ava(&mut self, desc: &SchemaAttribute, raw: &str) -> Result<(), SchemaError> {
        let v = desc.normalise_value(raw)?;
        match self.attr_find_mut(desc.name.as_str()) {
            Some(a) => a.vals.push(v),
            None => self.attrs.push(Attr {
                name: desc.name.clone(),
                vals: vec![v],
            }),
        }
        Ok(())
    }

    /// Shallow duplicate of the attribute list - containers copied, value
    /// bytes shared.
    pub(crate) fn dup_attrs(&self) -> Vec<Attr> {
        self.attrs.clone()
    }

    pub(crate) fn set_attrs(&mut self, attrs: Vec<Attr>) {
        self.attrs = attrs;
    }

    pub(crate) fn set_ocflags(&mut self, ocflags: u32) {
        self.ocflags = ocflags;
    }

    pub(crate) fn ocflags(&self) -> u32 {
        self.ocflags
    }

    pub(crate) fn clear_ocflags(&mut self) {
        self.ocflags = 0;
    }

    fn compute_ocflags(&self) -> u32 {
        let mut flags = OCF_CHECKED;
        if let Some(oc) = self.attr_find(ATTR_OBJECTCLASS) {
            if oc.vals.len() == 1 && oc.vals.iter().all(|v| v.norm() == CLASS_GLUE) {
                flags |= OCF_GLUE;
            }
            if oc.vals.iter().any(|v| v.norm() == CLASS_REFERRAL) {
                flags |= OCF_REFERRAL;
            }
        }
        flags
    }

    fn oc_derived(&self) -> u32 {
        if self.ocflags & OCF_CHECKED != 0 {
            self.ocflags
        } else {
            self.compute_ocflags()
        }
    }

    /// Refresh the cached derivation. Callers that only hold a shared
    /// reference fall back to computing on the fly.
    pub(crate) fn refresh_ocflags(&mut self) {
        self.ocflags = self.compute_ocflags();
    }

    /// A glue entry carries `objectClass: glue` and nothing else of note.
    pub fn is_glue(&self) -> bool {
        self.oc_derived() & OCF_GLUE != 0
    }

    pub fn is_referral(&self) -> bool {
        self.oc_derived() & OCF_REFERRAL != 0
    }

    /// The referral URIs of a referral entry, in presentation form.
    pub fn referral_urls(&self) -> Vec<String> {
        self.attr_find(ATTR_REF)
            .map(|a| a.vals.iter().map(|v| v.pres().to_string()).collect())
            .unwrap_or_default()
    }

    /// Drop every attribute the schema does not mark operational. This is the
    /// glue-promotion strip: the placeholder gives up its user content before
    /// the modification list rebuilds it.
    pub(crate) fn strip_non_operational(&mut self, schema: &Schema) {
        self.attrs.retain(|a| {
            schema
                .attribute(a.name.as_str())
                .map(|sa| sa.operational)
                .unwrap_or(false)
        });
    }

    pub fn to_proto_entry(&self) -> ProtoEntry {
        let mut attrs: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for a in &self.attrs {
            attrs.insert(
                a.name.to_string(),
                a.vals.iter().map(|v| v.pres().to_string()).collect(),
            );
        }
        ProtoEntry { attrs }
    }

    /// Build an entry from (attribute, values) pairs. Attribute order is
    /// preserved.
    pub fn from_pairs(
        schema: &Schema,
        id: u64,
        dn: &str,
        pairs: &[(&str, &[&str])],
    ) -> Result<Self, SchemaError> {
        let mut e = Entry::new(id, dn);
        for (attr, vals) in pairs {
            let desc = schema.resolve(attr)?;
            for raw in *vals {
                e.add_ava(&desc, raw)?;
            }
        }
        Ok(e)
    }

    // ==== the value engine ====

    /// Add the modification's values. All-or-nothing: a duplicate anywhere
    /// leaves the entry untouched unless the request is permissive, in which
    /// case duplicates are skipped.
    pub(crate) fn apply_add(&mut self, m: &Modify, permissive: bool) -> Result<(), OperationError> {
        let desc = &m.desc;
        let existing = self.attr_find(desc.name.as_str());
        let present = existing.map_or(0, |a| a.vals.len());

        let mut fresh: Vec<Value> = Vec::with_capacity(m.vals.len());
        for (i, v) in m.vals.iter().enumerate() {
            let dup = existing.map_or(false, |a| a.vals.contains(v)) || fresh.contains(v);
            if dup {
                if permissive {
                    continue;
                }
                return Err(OperationError::TypeOrValueExists(format!(
                    "modify/add: {}: value #{} already exists",
                    desc.name, i
                )));
            }
            fresh.push(v.clone());
        }

        if !desc.multivalue && present + fresh.len() > 1 {
            return Err(OperationError::ConstraintViolation(format!(
                "modify/add: {}: multiple values provided",
                desc.name
            )));
        }

        if fresh.is_empty() {
            return Ok(());
        }
        match self.attr_find_mut(desc.name.as_str()) {
            Some(a) => a.vals.extend(fresh),
            None => self.attrs.push(Attr {
                name: desc.name.clone(),
                vals: fresh,
            }),
        }
        Ok(())
    }

    /// Delete values, or the whole attribute when none are named. Removing
    /// the last value removes the attribute.
    pub(crate) fn apply_delete(
        &mut self,
        m: &Modify,
        permissive: bool,
    ) -> Result<(), OperationError> {
        let desc = &m.desc;

        if m.vals.is_empty() {
            if self.attr_remove(desc.name.as_str()).is_none() && !permissive {
                return Err(OperationError::NoSuchAttribute(format!(
                    "modify/delete: {}: no such attribute",
                    desc.name
                )));
            }
            return Ok(());
        }

        let Some(a) = self.attr_find(desc.name.as_str()) else {
            if permissive {
                return Ok(());
            }
            return Err(OperationError::NoSuchAttribute(format!(
                "modify/delete: {}: no such attribute",
                desc.name
            )));
        };

        let mut work = a.vals.clone();
        for (i, v) in m.vals.iter().enumerate() {
            match work.iter().position(|x| x == v) {
                Some(p) => {
                    work.remove(p);
                }
                None => {
                    if permissive {
                        continue;
                    }
                    return Err(OperationError::NoSuchAttribute(format!(
                        "modify/delete: {}: no such value #{}",
                        desc.name, i
                    )));
                }
            }
        }

        if work.is_empty() {
            self.attr_remove(desc.name.as_str());
        } else if let Some(a) = self.attr_find_mut(desc.name.as_str()) {
            a.vals = work;
        }
        Ok(())
    }

    /// Replace is delete-all followed by add, atomically. An empty value list
    /// removes the attribute. The replaced attribute keeps its position.
    pub(crate) fn apply_replace(
        &mut self,
        m: &Modify,
        permissive: bool,
    ) -> Result<(), OperationError> {
        let desc = &m.desc;

        let mut vals: Vec<Value> = Vec::with_capacity(m.vals.len());
        for (i, v) in m.vals.iter().enumerate() {
            if vals.contains(v) {
                if permissive {
                    continue;
                }
                return Err(OperationError::ConstraintViolation(format!(
                    "modify/replace: {}: value #{} provided more than once",
                    desc.name, i
                )));
            }
            vals.push(v.clone());
        }

        if !desc.multivalue && vals.len() > 1 {
            return Err(OperationError::ConstraintViolation(format!(
                "modify/replace: {}: multiple values provided",
                desc.name
            )));
        }

        if vals.is_empty() {
            self.attr_remove(desc.name.as_str());
        } else {
            match self.attr_find_mut(desc.name.as_str()) {
                Some(a) => a.vals = vals,
                None => self.attrs.push(Attr {
                    name: desc.name.clone(),
                    vals,
                }),
            }
        }
        Ok(())
    }

    /// Increment the (single) integer value by the supplied delta.
    pub(crate) fn apply_increment(
        &mut self,
        m: &Modify,
        _permissive: bool,
    ) -> Result<(), OperationError> {
        let desc = &m.desc;

        if desc.syntax != SyntaxType::Integer || desc.multivalue {
            return Err(OperationError::ConstraintViolation(format!(
                "modify/increment: {}: requires a single-valued integer attribute",
                desc.name
            )));
        }
        let delta = m
            .vals
            .first()
            .filter(|_| m.vals.len() == 1)
            .and_then(|v| v.norm().parse::<i64>().ok())
            .ok_or_else(|| {
                OperationError::ConstraintViolation(format!(
                    "modify/increment: {}: exactly one integer delta required",
                    desc.name
                ))
            })?;

        let Some(a) = self.attr_find_mut(desc.name.as_str()) else {
            return Err(OperationError::ConstraintViolation(format!(
                "modify/increment: {}: no such attribute",
                desc.name
            )));
        };

        let mut next: Vec<Value> = Vec::with_capacity(a.vals.len());
        for v in a.vals.iter() {
            let cur: i64 = v.norm().parse().map_err(|_| {
                OperationError::ConstraintViolation(format!(
                    "modify/increment: {}: existing value is not an integer",
                    desc.name
                ))
            })?;
            let sum = cur.checked_add(delta).ok_or_else(|| {
                OperationError::ConstraintViolation(format!(
                    "modify/increment: {}: integer overflow",
                    desc.name
                ))
            })?;
            let nv = Value::normalise(SyntaxType::Integer, &sum.to_string()).ok_or_else(|| {
                OperationError::ConstraintViolation(format!(
                    "modify/increment: {}: integer overflow",
                    desc.name
                ))
            })?;
            next.push(nv);
        }
        a.vals = next;
        Ok(())
    }

    /// As add, but an already-present value is not an error. Note the add
    /// stays all-or-nothing: when any value exists, nothing is applied and
    /// the operation still succeeds.
    pub(crate) fn apply_soft_add(
        &mut self,
        m: &Modify,
        permissive: bool,
    ) -> Result<(), OperationError> {
        match self.apply_add(m, permissive) {
            Err(OperationError::TypeOrValueExists(_)) => Ok(()),
            r => r,
        }
    }
}

/// Compare two attribute lists by canonical form. Order of attributes and of
/// values within them is significant.
#[cfg(test)]
pub(crate) fn attrs_eq(left: &[Attr], right: &[Attr]) -> bool {
    left.len() == right.len()
        && left.iter().zip(right.iter()).all(|(l, r)| {
            l.name == r.name
                && l.vals.len() == r.vals.len()
                && l.vals.iter().zip(r.vals.iter()).all(|(a, b)| {
                    a.norm() == b.norm() && a.pres() == b.pres()
                })
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modify::ModOp;
    use crate::schema::Schema;

    fn person(schema: &Schema) -> Entry {
        entry_init!(
            schema,
            1,
            "cn=Alice,dc=example,dc=com",
            (ATTR_OBJECTCLASS, ["person"]),
            ("cn", ["Alice"]),
            ("sn", ["Liddell"])
        )
    }

    #[test]
    fn test_apply_add_duplicate() {
        let schema = Schema::core();
        let mut e = person(&schema);
        let before = e.dup_attrs();

        let m = modify!(&schema, ModOp::Add, "cn", ["Alice"]);
        let r = e.apply_add(&m, false);
        assert!(matches!(r, Err(OperationError::TypeOrValueExists(_))));
        assert!(attrs_eq(&before, e.attrs()));

        // Permissive: succeeds, still exactly one value.
        assert!(e.apply_add(&m, true).is_ok());
        assert_eq!(e.attr_find("cn").expect("cn").vals.len(), 1);
    }

    #[test]
    fn test_apply_add_all_or_nothing() {
        let schema = Schema::core();
        let mut e = person(&schema);
        let before = e.dup_attrs();

        // Second value collides - the first must not land either.
        let m = modify!(&schema, ModOp::Add, "cn", ["Al", "alice"]);
        assert!(matches!(
            e.apply_add(&m, false),
            Err(OperationError::TypeOrValueExists(_))
        ));
        assert!(attrs_eq(&before, e.attrs()));
    }

    #[test]
    fn test_apply_add_case_insensitive_match() {
        let schema = Schema::core();
        let mut e = person(&schema);
        let m = modify!(&schema, ModOp::Add, "cn", ["ALICE"]);
        assert!(matches!(
            e.apply_add(&m, false),
            Err(OperationError::TypeOrValueExists(_))
        ));
    }

    #[test]
    fn test_apply_delete_last_value_removes_attr() {
        let schema = Schema::core();
        let mut e = person(&schema);
        let m = modify!(&schema, ModOp::Delete, "sn", ["Smith"]);
        assert!(matches!(
            e.apply_delete(&m, false),
            Err(OperationError::NoSuchAttribute(_))
        ));

        let m = modify!(&schema, ModOp::Delete, "sn", ["Liddell"]);
        assert!(e.apply_delete(&m, false).is_ok());
        assert!(e.attr_find("sn").is_none());
    }

    #[test]
    fn test_apply_delete_whole_attribute() {
        let schema = Schema::core();
        let mut e = person(&schema);
        let m = modify!(&schema, ModOp::Delete, "sn", []);
        assert!(e.apply_delete(&m, false).is_ok());
        assert!(e.attr_find("sn").is_none());

        // Absent now - error unless permissive.
        assert!(matches!(
            e.apply_delete(&m, false),
            Err(OperationError::NoSuchAttribute(_))
        ));
        assert!(e.apply_delete(&m, true).is_ok());
    }

    #[test]
    fn test_apply_replace_empty_removes() {
        let schema = Schema::core();
        let mut e = person(&schema);
        let desc = schema.resolve("mail").expect("mail");
        e.add_ava(&desc, "a@x").expect("valid");
        e.add_ava(&desc, "b@x").expect("valid");

        let m = modify!(&schema, ModOp::Replace, "mail", []);
        assert!(e.apply_replace(&m, false).is_ok());
        assert!(e.attr_find("mail").is_none());
    }

    #[test]
    fn test_apply_replace_duplicate_supplied() {
        let schema = Schema::core();
        let mut e = person(&schema);
        let m = modify!(&schema, ModOp::Replace, "mail", ["a@x", "A@X"]);
        assert!(matches!(
            e.apply_replace(&m, false),
            Err(OperationError::ConstraintViolation(_))
        ));
        // Permissive de-duplicates.
        assert!(e.apply_replace(&m, true).is_ok());
        assert_eq!(e.attr_find("mail").expect("mail").vals.len(), 1);
    }

    #[test]
    fn test_apply_replace_keeps_position() {
        let schema = Schema::core();
        let mut e = person(&schema);
        let m = modify!(&schema, ModOp::Replace, "cn", ["Alyss"]);
        assert!(e.apply_replace(&m, false).is_ok());
        // cn sits between objectclass and sn, where it started.
        assert_eq!(e.attrs()[1].name.as_str(), "cn");
        assert_eq!(e.attrs()[1].vals[0].pres(), "Alyss");
    }

    #[test]
    fn test_apply_increment() {
        let schema = Schema::core();
        let mut e = entry_init!(
            &schema,
            7,
            "uid=fred,dc=example,dc=com",
            (ATTR_OBJECTCLASS, ["posixaccount"]),
            ("cn", ["fred"]),
            ("uid", ["fred"]),
            ("uidnumber", ["1000"]),
            ("gidnumber", ["100"])
        );
        let m = modify!(&schema, ModOp::Increment, "uidnumber", ["5"]);
        assert!(e.apply_increment(&m, false).is_ok());
        assert_eq!(
            e.attr_find("uidnumber").expect("uidnumber").vals[0].norm(),
            "1005"
        );

        // Non-integer syntax refused.
        let m = modify!(&schema, ModOp::Increment, "cn", ["5"]);
        assert!(matches!(
            e.apply_increment(&m, false),
            Err(OperationError::ConstraintViolation(_))
        ));

        // Absent attribute refused.
        let m = modify!(&schema, ModOp::Increment, "loginshell", ["1"]);
        assert!(matches!(
            e.apply_increment(&m, false),
            Err(OperationError::ConstraintViolation(_))
        ));
    }

    #[test]
    fn test_apply_soft_add() {
        let schema = Schema::core();
        let mut e = person(&schema);
        let m = modify!(&schema, ModOp::SoftAdd, "cn", ["Alice"]);
        assert!(e.apply_soft_add(&m, false).is_ok());
        assert_eq!(e.attr_find("cn").expect("cn").vals.len(), 1);

        let m = modify!(&schema, ModOp::SoftAdd, "cn", ["Alicia"]);
        assert!(e.apply_soft_add(&m, false).is_ok());
        assert_eq!(e.attr_find("cn").expect("cn").vals.len(), 2);
    }

    #[test]
    fn test_glue_detection() {
        let schema = Schema::core();
        let g = entry_init!(
            &schema,
            8,
            "dc=example,dc=com",
            (ATTR_OBJECTCLASS, [CLASS_GLUE])
        );
        assert!(g.is_glue());
        assert!(!g.is_referral());

        let r = entry_init!(
            &schema,
            9,
            "dc=elsewhere,dc=com",
            (ATTR_OBJECTCLASS, [CLASS_REFERRAL]),
            (ATTR_REF, ["ldap://other.example.com/dc=elsewhere,dc=com"])
        );
        assert!(r.is_referral());
        assert_eq!(r.referral_urls().len(), 1);
    }

    #[test]
    fn test_strip_non_operational() {
        let schema = Schema::core();
        let mut e = person(&schema);
        let soc = schema.resolve(ATTR_STRUCTURAL_OBJECTCLASS).expect("soc");
        e.add_ava(&soc, "person").expect("valid");
        e.strip_non_operational(&schema);
        assert_eq!(e.attrs().len(), 1);
        assert_eq!(e.attrs()[0].name.as_str(), ATTR_STRUCTURAL_OBJECTCLASS);
    }
}
