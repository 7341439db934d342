//! The operation dispatch layer. A decoded request arrives here; dispatch
//! validates its shape, normalises the target name, selects the backend
//! holding that naming context, enforces the replica write rule, invokes the
//! backend's modify entry point, and on success appends to the replication
//! log. The reply is written to the client through the [`ReplySink`].

use std::sync::Arc;

use crate::prelude::*;
use crate::repl::ReplicationLog;
use crate::time::format_generalized_time;

/// The consumed reply encoder seam.
pub trait ReplySink {
    fn send_ldap_result(&mut self, res: &LdapResult);
}

/// The backend contract. A backend that does not override `modify` refuses
/// the operation - this is where alternative backends (for example one that
/// pipes requests to an external process) plug in.
pub trait DirBackend: Send + Sync {
    /// The normalised naming context this backend holds.
    fn suffix_ndn(&self) -> &str;

    /// Set on a replica: the only identity allowed to write here.
    fn update_ndn(&self) -> Option<&str> {
        None
    }

    fn modify(
        &self,
        op: &Operation,
        dn: &str,
        ndn: &str,
        modlist: ModifyList<ModifyInvalid>,
    ) -> Result<ModifySuccess, OperationError> {
        let _ = (op, dn, ndn, modlist);
        Err(OperationError::UnwillingToPerform(
            "Function not implemented".to_string(),
        ))
    }
}

impl DirBackend for Backend {
    fn suffix_ndn(&self) -> &str {
        Backend::suffix_ndn(self)
    }

    fn update_ndn(&self) -> Option<&str> {
        Backend::update_ndn(self)
    }

    fn modify(
        &self,
        op: &Operation,
        dn: &str,
        ndn: &str,
        modlist: ModifyList<ModifyInvalid>,
    ) -> Result<ModifySuccess, OperationError> {
        Backend::modify(self, op, dn, ndn, modlist)
    }
}

pub struct Server {
    schema: Arc<Schema>,
    cfg: ServerConfig,
    backends: Vec<Arc<dyn DirBackend>>,
    replog: Arc<dyn ReplicationLog>,
    clock: Arc<dyn Clock>,
}

impl Server {
    pub fn new(
        schema: Arc<Schema>,
        cfg: ServerConfig,
        replog: Arc<dyn ReplicationLog>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Server {
            schema,
            cfg,
            backends: Vec::new(),
            replog,
            clock,
        }
    }

    pub fn register_backend(&mut self, be: Arc<dyn DirBackend>) {
        self.backends.push(be);
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// Longest-suffix match over the registered naming contexts.
    fn select_backend(&self, ndn: &str) -> Option<&Arc<dyn DirBackend>> {
        self.backends
            .iter()
            .filter(|be| {
                let suffix = be.suffix_ndn();
                ndn == suffix
                    || (ndn.ends_with(suffix)
                        && ndn[..ndn.len() - suffix.len()].ends_with(','))
            })
            .max_by_key(|be| be.suffix_ndn().len())
    }

    /// Handle one decoded Modify request. Returns the reply code written to
    /// the sink, or `None` when the operation was abandoned and no reply is
    /// sent at all.
    #[instrument(level = "debug", skip_all, fields(conn = op.conn_id, opid = op.op_id))]
    pub fn modify(
        &self,
        op: &Operation,
        req: &ModifyRequest,
        sink: &mut dyn ReplySink,
    ) -> Option<ResultCode> {
        info!(conn = op.conn_id, opid = op.op_id, dn = %req.dn, "MOD");

        if req.changes.is_empty() {
            return self.reply(
                sink,
                LdapResult::new(ResultCode::ProtocolError, "empty modify request"),
            );
        }

        let ndn = dn_normalise(&req.dn);

        // Parse the change list. Op-range and value-presence rules are
        // enforced here; anything that fails never reaches a backend.
        let modlist = match ModifyList::from_request(req, &self.schema) {
            Ok(ml) => ml,
            Err(e) => {
                let res = self.err_to_result(&e);
                return self.reply(sink, res);
            }
        };

        let Some(be) = self.select_backend(&ndn) else {
            debug!(dn = %req.dn, "modify: no backend for target");
            return self.reply(sink, self.referral_result(ResultCode::PartialResults));
        };

        // A replica only accepts writes from its replication principal;
        // everyone else is pointed at the master.
        if let Some(update_ndn) = be.update_ndn() {
            if op.ident.bind_ndn() != Some(update_ndn) {
                return self.reply(sink, self.referral_result(ResultCode::PartialResults));
            }
        }

        // Keep the client's list as parsed for the replication log.
        let replog_mods = modlist.clone();

        match be.modify(op, &req.dn, &ndn, modlist) {
            Ok(success) => {
                let code = if success.noop {
                    ResultCode::NoOperation
                } else {
                    if let Err(e) = self.replog_append(&req.dn, &replog_mods) {
                        warn!(?e, "modify: replog append failed");
                    }
                    ResultCode::Success
                };
                let mut res = LdapResult::new(code, "");
                res.controls = success.controls;
                self.reply(sink, res)
            }
            Err(OperationError::Abandoned) => {
                debug!("modify: abandoned, no reply");
                None
            }
            Err(e) => {
                let res = self.err_to_result(&e);
                self.reply(sink, res)
            }
        }
    }

    fn reply(&self, sink: &mut dyn ReplySink, res: LdapResult) -> Option<ResultCode> {
        sink.send_ldap_result(&res);
        Some(res.code)
    }

    fn referral_result(&self, code: ResultCode) -> LdapResult {
        let mut res = LdapResult::new(code, "");
        res.referral = self.cfg.default_referral.clone();
        res
    }

    fn replog_append<VALID>(
        &self,
        dn: &str,
        ml: &ModifyList<VALID>,
    ) -> Result<(), OperationError> {
        let at = format_generalized_time(self.clock.now());
        let rec = ReplogEntry::new_modify(dn, ml, at);
        self.replog.append(&rec.to_json()?)
    }

    /// The single mapping from internal errors to wire results.
    fn err_to_result(&self, e: &OperationError) -> LdapResult {
        match e {
            OperationError::ProtocolError(s) => LdapResult::new(ResultCode::ProtocolError, s),
            OperationError::EmptyRequest => {
                LdapResult::new(ResultCode::ProtocolError, "empty modify request")
            }
            OperationError::AccessDenied => {
                LdapResult::new(ResultCode::InsufficientAccessRights, "")
            }
            OperationError::AssertionFailed => LdapResult::new(ResultCode::AssertionFailed, ""),
            OperationError::Referral { matched, refs } => LdapResult {
                code: ResultCode::Referral,
                matched: matched.clone(),
                message: String::new(),
                referral: refs.clone(),
                controls: Vec::new(),
            },
            OperationError::UnwillingToPerform(s) => {
                LdapResult::new(ResultCode::UnwillingToPerform, s)
            }
            OperationError::NoSuchObject => LdapResult::new(ResultCode::NoSuchObject, ""),
            OperationError::NoSuchAttribute(s) => LdapResult::new(ResultCode::NoSuchAttribute, s),
            OperationError::TypeOrValueExists(s) => {
                LdapResult::new(ResultCode::AttributeOrValueExists, s)
            }
            OperationError::ConstraintViolation(s) => {
                LdapResult::new(ResultCode::ConstraintViolation, s)
            }
            OperationError::SchemaViolation(se) => {
                let code = match se {
                    SchemaError::InvalidAttribute(_) => ResultCode::UndefinedAttributeType,
                    SchemaError::InvalidAttributeSyntax(_) => ResultCode::InvalidAttributeSyntax,
                    SchemaError::SingleValueConstraint(_) => ResultCode::ConstraintViolation,
                    _ => ResultCode::ObjectClassViolation,
                };
                LdapResult::new(code, &format!("{:?}", se))
            }
            OperationError::Busy => LdapResult::new(ResultCode::Busy, "ldap server busy"),
            OperationError::NoOperation => LdapResult::new(ResultCode::NoOperation, ""),
            OperationError::Abandoned | OperationError::Other(_) => {
                LdapResult::new(ResultCode::Other, "internal error")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use cadastre_proto::v1::{MOD_OP_ADD, MOD_OP_REPLACE};

    use super::*;
    use crate::access::AllowAllAccess;
    use crate::be::memory::MemStore;
    use crate::be::StoreError;
    use crate::repl::MemReplicationLog;
    use crate::schema::Schema;
    use crate::testkit::test_init;
    use crate::time::FixedClock;

    #[derive(Default)]
    struct VecSink {
        sent: Vec<LdapResult>,
    }

    impl ReplySink for VecSink {
        fn send_ldap_result(&mut self, res: &LdapResult) {
            self.sent.push(res.clone());
        }
    }

    struct NullBackend;

    impl DirBackend for NullBackend {
        fn suffix_ndn(&self) -> &str {
            "dc=null,dc=com"
        }
    }

    struct Harness {
        server: Server,
        store: Arc<MemStore>,
        replog: Arc<MemReplicationLog>,
    }

    fn harness_with(cfg: BackendConfig) -> Harness {
        let schema = Arc::new(Schema::core());
        let store = Arc::new(MemStore::new([AttrString::from("cn")]));
        store.insert_entry(entry_init!(
            &schema,
            1,
            "dc=example,dc=com",
            (ATTR_OBJECTCLASS, ["organizationalunit"]),
            ("ou", ["example"])
        ));
        store.insert_entry(entry_init!(
            &schema,
            2,
            "cn=Alice,dc=example,dc=com",
            (ATTR_OBJECTCLASS, ["person"]),
            ("cn", ["Alice"]),
            ("sn", ["Liddell"])
        ));
        let replog = Arc::new(MemReplicationLog::new());
        let clock = Arc::new(FixedClock::default());
        let be = Backend::new(
            cfg,
            &ServerConfig::default(),
            store.clone(),
            schema.clone(),
            Arc::new(AllowAllAccess),
            clock.clone(),
        );
        let mut server = Server::new(
            schema.clone(),
            ServerConfig::default(),
            replog.clone(),
            clock,
        );
        server.register_backend(Arc::new(be));
        Harness {
            server,
            store,
            replog,
        }
    }

    fn harness() -> Harness {
        harness_with(BackendConfig {
            suffix: "dc=example,dc=com".to_string(),
            ..Default::default()
        })
    }

    fn bound_op() -> Operation {
        Operation::new(7, 3, Identity::authenticated("cn=Manager,dc=example,dc=com"))
    }

    fn replace_description() -> ModifyRequest {
        ModifyRequest {
            dn: "cn=Alice,dc=example,dc=com".to_string(),
            changes: vec![ProtoModify {
                op: MOD_OP_REPLACE,
                atype: "description".to_string(),
                vals: vec!["through the looking glass".to_string()],
            }],
        }
    }

    #[test]
    fn test_dispatch_success_and_replog() {
        test_init();
        let h = harness();
        let op = bound_op();
        let mut sink = VecSink::default();

        let code = h.server.modify(&op, &replace_description(), &mut sink);
        assert_eq!(code, Some(ResultCode::Success));
        assert_eq!(sink.sent.len(), 1);

        let after = h
            .store
            .entry_by_ndn("cn=alice,dc=example,dc=com")
            .expect("entry");
        assert!(after.attr_find("description").is_some());

        let lines = h.replog.lines();
        assert_eq!(lines.len(), 1);
        let rec: ReplogEntry = serde_json::from_str(&lines[0]).expect("replog json");
        assert_eq!(rec.dn, "cn=Alice,dc=example,dc=com");
        assert_eq!(rec.mods.len(), 1);
        assert_eq!(rec.mods[0].op, "replace");
    }

    #[test]
    fn test_dispatch_rejects_bad_op_value() {
        let h = harness();
        let op = bound_op();
        let mut sink = VecSink::default();

        let req = ModifyRequest {
            dn: "cn=Alice,dc=example,dc=com".to_string(),
            changes: vec![ProtoModify {
                op: 3,
                atype: "description".to_string(),
                vals: vec!["x".to_string()],
            }],
        };
        let code = h.server.modify(&op, &req, &mut sink);
        assert_eq!(code, Some(ResultCode::ProtocolError));
        assert!(h.replog.lines().is_empty());
    }

    #[test]
    fn test_dispatch_rejects_empty_values_on_add() {
        let h = harness();
        let op = bound_op();
        let mut sink = VecSink::default();

        let req = ModifyRequest {
            dn: "cn=Alice,dc=example,dc=com".to_string(),
            changes: vec![ProtoModify {
                op: MOD_OP_ADD,
                atype: "description".to_string(),
                vals: vec![],
            }],
        };
        let code = h.server.modify(&op, &req, &mut sink);
        assert_eq!(code, Some(ResultCode::ProtocolError));
        assert_eq!(sink.sent[0].message, "no values given");
    }

    #[test]
    fn test_dispatch_rejects_empty_change_list() {
        let h = harness();
        let op = bound_op();
        let mut sink = VecSink::default();

        let req = ModifyRequest {
            dn: "cn=Alice,dc=example,dc=com".to_string(),
            changes: vec![],
        };
        let code = h.server.modify(&op, &req, &mut sink);
        assert_eq!(code, Some(ResultCode::ProtocolError));
    }

    #[test]
    fn test_dispatch_unknown_attribute() {
        let h = harness();
        let op = bound_op();
        let mut sink = VecSink::default();

        let req = ModifyRequest {
            dn: "cn=Alice,dc=example,dc=com".to_string(),
            changes: vec![ProtoModify {
                op: MOD_OP_REPLACE,
                atype: "flargle".to_string(),
                vals: vec!["x".to_string()],
            }],
        };
        let code = h.server.modify(&op, &req, &mut sink);
        assert_eq!(code, Some(ResultCode::UndefinedAttributeType));
    }

    #[test]
    fn test_dispatch_no_backend_owns_name() {
        let h = harness();
        let op = bound_op();
        let mut sink = VecSink::default();

        let req = ModifyRequest {
            dn: "cn=Someone,dc=elsewhere,dc=net".to_string(),
            changes: vec![ProtoModify {
                op: MOD_OP_REPLACE,
                atype: "description".to_string(),
                vals: vec!["x".to_string()],
            }],
        };
        let code = h.server.modify(&op, &req, &mut sink);
        assert_eq!(code, Some(ResultCode::PartialResults));
        assert!(!sink.sent[0].referral.is_empty());
    }

    #[test]
    fn test_dispatch_backend_without_modify() {
        let schema = Arc::new(Schema::core());
        let replog = Arc::new(MemReplicationLog::new());
        let mut server = Server::new(
            schema,
            ServerConfig::default(),
            replog,
            Arc::new(FixedClock::default()),
        );
        server.register_backend(Arc::new(NullBackend));

        let op = bound_op();
        let mut sink = VecSink::default();
        let req = ModifyRequest {
            dn: "cn=X,dc=null,dc=com".to_string(),
            changes: vec![ProtoModify {
                op: MOD_OP_REPLACE,
                atype: "description".to_string(),
                vals: vec!["x".to_string()],
            }],
        };
        let code = server.modify(&op, &req, &mut sink);
        assert_eq!(code, Some(ResultCode::UnwillingToPerform));
    }

    #[test]
    fn test_dispatch_replica_update_rule() {
        let h = harness_with(BackendConfig {
            suffix: "dc=example,dc=com".to_string(),
            update_ndn: Some("cn=Replicator,dc=example,dc=com".to_string()),
            ..Default::default()
        });

        // A normal bind is referred to the master.
        let op = bound_op();
        let mut sink = VecSink::default();
        let code = h.server.modify(&op, &replace_description(), &mut sink);
        assert_eq!(code, Some(ResultCode::PartialResults));

        // The replication principal may write - and its writes are not
        // re-stamped.
        let op = Operation::new(
            7,
            4,
            Identity::authenticated("CN=Replicator,DC=Example,DC=Com"),
        );
        let mut sink = VecSink::default();
        let code = h.server.modify(&op, &replace_description(), &mut sink);
        assert_eq!(code, Some(ResultCode::Success));
        let after = h
            .store
            .entry_by_ndn("cn=alice,dc=example,dc=com")
            .expect("entry");
        assert!(after.attr_find(ATTR_MODIFY_TIMESTAMP).is_none());
    }

    #[test]
    fn test_dispatch_noop_reply_and_no_replog() {
        let h = harness();
        let mut op = bound_op();
        op.noop = true;
        let mut sink = VecSink::default();

        let code = h.server.modify(&op, &replace_description(), &mut sink);
        assert_eq!(code, Some(ResultCode::NoOperation));
        assert!(h.replog.lines().is_empty());
        let after = h
            .store
            .entry_by_ndn("cn=alice,dc=example,dc=com")
            .expect("entry");
        assert!(after.attr_find("description").is_none());
    }

    #[test]
    fn test_dispatch_abandoned_sends_nothing() {
        let h = harness();
        let op = bound_op();
        op.abandon();
        h.store.inject_lookup_fault(StoreError::Deadlock);
        let mut sink = VecSink::default();

        let code = h.server.modify(&op, &replace_description(), &mut sink);
        assert_eq!(code, None);
        assert!(sink.sent.is_empty());
        assert!(h.replog.lines().is_empty());
    }

    #[test]
    fn test_dispatch_referral_reply_carries_matched() {
        let h = harness();
        let op = bound_op();
        let mut sink = VecSink::default();

        let req = ModifyRequest {
            dn: "cn=Ghost,ou=Nowhere,dc=example,dc=com".to_string(),
            changes: vec![ProtoModify {
                op: MOD_OP_REPLACE,
                atype: "description".to_string(),
                vals: vec!["x".to_string()],
            }],
        };
        let code = h.server.modify(&op, &req, &mut sink);
        assert_eq!(code, Some(ResultCode::Referral));
        assert_eq!(sink.sent[0].matched.as_deref(), Some("dc=example,dc=com"));
        assert!(!sink.sent[0].referral.is_empty());
    }

    #[test]
    fn test_dispatch_duplicate_value_reply() {
        let h = harness();
        let op = bound_op();
        let mut sink = VecSink::default();

        let req = ModifyRequest {
            dn: "cn=Alice,dc=example,dc=com".to_string(),
            changes: vec![ProtoModify {
                op: MOD_OP_ADD,
                atype: "cn".to_string(),
                vals: vec!["Alice".to_string()],
            }],
        };
        let code = h.server.modify(&op, &req, &mut sink);
        assert_eq!(code, Some(ResultCode::AttributeOrValueExists));
    }

    #[test]
    fn test_select_backend_longest_suffix() {
        let schema = Arc::new(Schema::core());
        let replog = Arc::new(MemReplicationLog::new());
        let clock = Arc::new(FixedClock::default());
        let mut server = Server::new(
            schema.clone(),
            ServerConfig::default(),
            replog,
            clock.clone(),
        );

        let store_wide = Arc::new(MemStore::new(Vec::<AttrString>::new()));
        let wide = Backend::new(
            BackendConfig {
                suffix: "dc=com".to_string(),
                ..Default::default()
            },
            &ServerConfig::default(),
            store_wide,
            schema.clone(),
            Arc::new(AllowAllAccess),
            clock.clone(),
        );
        let store_narrow = Arc::new(MemStore::new(Vec::<AttrString>::new()));
        let narrow = Backend::new(
            BackendConfig {
                suffix: "dc=example,dc=com".to_string(),
                ..Default::default()
            },
            &ServerConfig::default(),
            store_narrow,
            schema.clone(),
            Arc::new(AllowAllAccess),
            clock,
        );
        server.register_backend(Arc::new(wide));
        server.register_backend(Arc::new(narrow));

        let be = server
            .select_backend("cn=alice,dc=example,dc=com")
            .expect("backend");
        assert_eq!(be.suffix_ndn(), "dc=example,dc=com");

        let be = server.select_backend("cn=x,dc=other,dc=com").expect("backend");
        assert_eq!(be.suffix_ndn(), "dc=com");

        assert!(server.select_backend("cn=x,dc=net").is_none());
    }
}
