//! Attribute and class names the core needs to recognise. All names are in
//! their normalised (lowercase) form.

pub const ATTR_OBJECTCLASS: &str = "objectclass";
pub const ATTR_STRUCTURAL_OBJECTCLASS: &str = "structuralobjectclass";

pub const ATTR_CREATORS_NAME: &str = "creatorsname";
pub const ATTR_CREATE_TIMESTAMP: &str = "createtimestamp";
pub const ATTR_MODIFIERS_NAME: &str = "modifiersname";
pub const ATTR_MODIFY_TIMESTAMP: &str = "modifytimestamp";

pub const ATTR_REF: &str = "ref";

pub const CLASS_GLUE: &str = "glue";
pub const CLASS_REFERRAL: &str = "referral";

/// The modifiersName value recorded when the operation has no bind identity.
pub const NULL_DN: &str = "NULLDN";

/// The four operational attributes that are stripped from client modlists
/// before server stamps are prepended.
pub const LASTMOD_ATTRS: [&str; 4] = [
    ATTR_MODIFY_TIMESTAMP,
    ATTR_MODIFIERS_NAME,
    ATTR_CREATE_TIMESTAMP,
    ATTR_CREATORS_NAME,
];
