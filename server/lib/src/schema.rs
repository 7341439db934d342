//! The schema registry. Attribute types resolve names to syntaxes and
//! matching behaviour, classes express what an entry must and may contain,
//! and [`Schema::check_entry`] is the gate every modified entry passes before
//! it can be persisted. The registry is built once at startup and read-only
//! afterwards.

use std::sync::Arc;

use hashbrown::HashMap;

use crate::prelude::*;

/// Normalise an attribute description for lookup - trimmed, ascii lowercased.
pub fn attr_normalise(raw: &str) -> AttrString {
    AttrString::from(raw.trim().to_ascii_lowercase().as_str())
}

/// A single attribute type. The `operational` flag marks server-managed
/// attributes - these are exempt from class must/may containment and survive
/// glue promotion.
#[derive(Debug, Clone)]
pub struct SchemaAttribute {
    pub name: AttrString,
    pub description: String,
    pub multivalue: bool,
    pub operational: bool,
    pub syntax: SyntaxType,
}

impl SchemaAttribute {
    /// Normalise a raw value under this attribute's syntax.
    pub fn normalise_value(&self, raw: &str) -> Result<Value, SchemaError> {
        Value::normalise(self.syntax, raw)
            .ok_or_else(|| SchemaError::InvalidAttributeSyntax(self.name.to_string()))
    }
}

/// A class and its content rules. Classes are additive - an entry's allowed
/// attribute set is the union over all of its classes.
#[derive(Debug, Clone, Default)]
pub struct SchemaClass {
    pub name: AttrString,
    pub description: String,
    pub systemmust: Vec<AttrString>,
    pub systemmay: Vec<AttrString>,
}

#[derive(Debug)]
pub struct Schema {
    attributes: HashMap<AttrString, Arc<SchemaAttribute>>,
    classes: HashMap<AttrString, SchemaClass>,
}

impl Schema {
    /// Resolve a raw attribute description to its schema entry.
    pub fn resolve(&self, raw: &str) -> Result<Arc<SchemaAttribute>, SchemaError> {
        let name = attr_normalise(raw);
        self.attributes
            .get(name.as_str())
            .cloned()
            .ok_or_else(|| SchemaError::InvalidAttribute(name.to_string()))
    }

    pub fn attribute(&self, name: &str) -> Option<&Arc<SchemaAttribute>> {
        self.attributes.get(name)
    }

    pub fn class(&self, name: &str) -> Option<&SchemaClass> {
        self.classes.get(name)
    }

    /// Check that an entry still obeys the schema: every attribute known,
    /// single-valued attributes single-valued, classes resolvable, required
    /// attributes present, and user attributes contained by the class union.
    /// `manage` relaxes the structural-class consistency rule the way a
    /// directory-management client is allowed to.
    pub fn check_entry(&self, entry: &Entry, manage: bool) -> Result<(), SchemaError> {
        for attr in entry.attrs() {
            let sa = self
                .attributes
                .get(attr.name.as_str())
                .ok_or_else(|| SchemaError::InvalidAttribute(attr.name.to_string()))?;
            if !sa.multivalue && attr.vals.len() > 1 {
                return Err(SchemaError::SingleValueConstraint(attr.name.to_string()));
            }
        }

        let oc = entry
            .attr_find(ATTR_OBJECTCLASS)
            .ok_or(SchemaError::NoClassFound)?;

        let mut classes = Vec::with_capacity(oc.vals.len());
        let mut unknown = Vec::new();
        for v in oc.vals.iter() {
            match self.classes.get(v.norm()) {
                Some(c) => classes.push(c),
                None => unknown.push(v.norm().to_string()),
            }
        }
        if !unknown.is_empty() {
            return Err(SchemaError::InvalidClass(unknown));
        }

        // The structural class must be one of the entry's classes.
        if !manage {
            if let Some(soc) = entry
                .attr_find(ATTR_STRUCTURAL_OBJECTCLASS)
                .and_then(|a| a.vals.first())
            {
                if !oc.vals.iter().any(|v| v.norm() == soc.norm()) {
                    return Err(SchemaError::InvalidClass(vec![soc.norm().to_string()]));
                }
            }
        }

        let missing: Vec<String> = classes
            .iter()
            .flat_map(|c| c.systemmust.iter())
            .filter(|m| entry.attr_find(m.as_str()).is_none())
            .map(|m| m.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(SchemaError::MissingMustAttribute(missing));
        }

        for attr in entry.attrs() {
            // Resolved in the first pass.
            let operational = self
                .attributes
                .get(attr.name.as_str())
                .map(|sa| sa.operational)
                .unwrap_or(false);
            if operational || attr.name.as_str() == ATTR_OBJECTCLASS {
                continue;
            }
            let allowed = classes.iter().any(|c| {
                c.systemmust.iter().any(|m| m == &attr.name)
                    || c.systemmay.iter().any(|m| m == &attr.name)
            });
            if !allowed {
                return Err(SchemaError::AttributeNotValidForClass(attr.name.to_string()));
            }
        }

        Ok(())
    }

    /// The bootstrap schema. A deliberately small but realistic core set -
    /// enough for the operational attributes the server stamps, referral and
    /// glue handling, and common person/ou/posix entries.
    pub fn core() -> Self {
        let mut attributes = HashMap::new();
        let mut classes = HashMap::new();

        let mut attr = |name: &str, multivalue: bool, operational: bool, syntax: SyntaxType, description: &str| {
            let name: AttrString = name.into();
            attributes.insert(
                name.clone(),
                Arc::new(SchemaAttribute {
                    name,
                    description: description.to_string(),
                    multivalue,
                    operational,
                    syntax,
                }),
            );
        };

        attr(
            ATTR_OBJECTCLASS,
            true,
            false,
            SyntaxType::Utf8StringInsensitive,
            "The classes of the entry",
        );
        attr(
            ATTR_STRUCTURAL_OBJECTCLASS,
            false,
            true,
            SyntaxType::Utf8StringInsensitive,
            "The structural class of the entry",
        );
        attr(
            ATTR_CREATORS_NAME,
            false,
            true,
            SyntaxType::DistinguishedName,
            "The dn of the identity that created the entry",
        );
        attr(
            ATTR_CREATE_TIMESTAMP,
            false,
            true,
            SyntaxType::GeneralizedTime,
            "When the entry was created",
        );
        attr(
            ATTR_MODIFIERS_NAME,
            false,
            true,
            SyntaxType::DistinguishedName,
            "The dn of the identity that last modified the entry",
        );
        attr(
            ATTR_MODIFY_TIMESTAMP,
            false,
            true,
            SyntaxType::GeneralizedTime,
            "When the entry was last modified",
        );
        attr(
            ATTR_REF,
            true,
            false,
            SyntaxType::Utf8String,
            "Referral URIs",
        );
        attr("cn", true, false, SyntaxType::Utf8StringInsensitive, "Common name");
        attr("sn", true, false, SyntaxType::Utf8StringInsensitive, "Surname");
        attr("ou", true, false, SyntaxType::Utf8StringInsensitive, "Organisational unit name");
        attr("uid", true, false, SyntaxType::Utf8StringInsensitive, "User id");
        attr(
            "description",
            true,
            false,
            SyntaxType::Utf8StringInsensitive,
            "A description of the entry",
        );
        attr("mail", true, false, SyntaxType::Utf8StringInsensitive, "Mail addresses");
        attr(
            "telephonenumber",
            true,
            false,
            SyntaxType::Utf8StringInsensitive,
            "Telephone numbers",
        );
        attr(
            "seealso",
            true,
            false,
            SyntaxType::DistinguishedName,
            "Related entries",
        );
        attr(
            "userpassword",
            true,
            false,
            SyntaxType::OctetString,
            "Password values, matched byte-exact",
        );
        attr("uidnumber", false, false, SyntaxType::Integer, "Posix uid");
        attr("gidnumber", false, false, SyntaxType::Integer, "Posix gid");
        attr("loginshell", false, false, SyntaxType::Utf8String, "Posix login shell");

        let mut class = |name: &str, must: &[&str], may: &[&str], description: &str| {
            let name: AttrString = name.into();
            classes.insert(
                name.clone(),
                SchemaClass {
                    name,
                    description: description.to_string(),
                    systemmust: must.iter().map(|s| AttrString::from(*s)).collect(),
                    systemmay: may.iter().map(|s| AttrString::from(*s)).collect(),
                },
            );
        };

        class("top", &[], &[], "The root of the class hierarchy");
        class(
            CLASS_GLUE,
            &[],
            &[],
            "A subtree placeholder holding no user content",
        );
        class(
            CLASS_REFERRAL,
            &[ATTR_REF],
            &[],
            "An entry that refers the client elsewhere",
        );
        class(
            "person",
            &["cn", "sn"],
            &["description", "mail", "telephonenumber", "seealso", "userpassword"],
            "A person",
        );
        class(
            "organizationalunit",
            &["ou"],
            &["description"],
            "An organisational unit",
        );
        class(
            "posixaccount",
            &["cn", "uid", "uidnumber", "gidnumber"],
            &["description", "loginshell"],
            "A posix account",
        );

        Schema {
            attributes,
            classes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_resolve() {
        let schema = Schema::core();
        let cn = schema.resolve("  CN ").expect("cn resolves");
        assert_eq!(cn.name.as_str(), "cn");
        assert!(cn.multivalue);
        assert!(matches!(
            schema.resolve("flargle"),
            Err(SchemaError::InvalidAttribute(_))
        ));
    }

    #[test]
    fn test_schema_check_entry() {
        let schema = Schema::core();
        let e = entry_init!(
            &schema,
            1,
            "cn=Alice,dc=example,dc=com",
            (ATTR_OBJECTCLASS, ["top", "person"]),
            ("cn", ["Alice"]),
            ("sn", ["Liddell"])
        );
        assert!(schema.check_entry(&e, false).is_ok());

        // Missing must: sn.
        let e = entry_init!(
            &schema,
            2,
            "cn=Bob,dc=example,dc=com",
            (ATTR_OBJECTCLASS, ["person"]),
            ("cn", ["Bob"])
        );
        assert!(matches!(
            schema.check_entry(&e, false),
            Err(SchemaError::MissingMustAttribute(_))
        ));

        // Attribute outside the class union.
        let e = entry_init!(
            &schema,
            3,
            "cn=Eve,dc=example,dc=com",
            (ATTR_OBJECTCLASS, ["person"]),
            ("cn", ["Eve"]),
            ("sn", ["Moneypenny"]),
            ("uidnumber", ["1000"])
        );
        assert!(matches!(
            schema.check_entry(&e, false),
            Err(SchemaError::AttributeNotValidForClass(_))
        ));

        // Unknown class.
        let e = entry_init!(
            &schema,
            4,
            "cn=Mal,dc=example,dc=com",
            (ATTR_OBJECTCLASS, ["spaceship"]),
            ("cn", ["Mal"])
        );
        assert!(matches!(
            schema.check_entry(&e, false),
            Err(SchemaError::InvalidClass(_))
        ));
    }

    #[test]
    fn test_schema_check_single_value() {
        let schema = Schema::core();
        let e = entry_init!(
            &schema,
            5,
            "uid=fred,dc=example,dc=com",
            (ATTR_OBJECTCLASS, ["posixaccount"]),
            ("cn", ["fred"]),
            ("uid", ["fred"]),
            ("uidnumber", ["1000", "1001"]),
            ("gidnumber", ["100"])
        );
        assert!(matches!(
            schema.check_entry(&e, false),
            Err(SchemaError::SingleValueConstraint(_))
        ));
    }

    #[test]
    fn test_schema_check_structural_consistency() {
        let schema = Schema::core();
        let mut e = entry_init!(
            &schema,
            6,
            "cn=Alice,dc=example,dc=com",
            (ATTR_OBJECTCLASS, ["person"]),
            ("cn", ["Alice"]),
            ("sn", ["Liddell"])
        );
        let soc = schema.resolve(ATTR_STRUCTURAL_OBJECTCLASS).expect("resolves");
        e.add_ava(&soc, "organizationalunit").expect("valid value");
        assert!(matches!(
            schema.check_entry(&e, false),
            Err(SchemaError::InvalidClass(_))
        ));
        // A management context may hold the inconsistency.
        assert!(schema.check_entry(&e, true).is_ok());
    }
}
