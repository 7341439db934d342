//! Construction macros, mainly for tests: building entries and modification
//! lists against a schema without the ceremony.

#[macro_export]
macro_rules! entry_init {
    ($schema:expr, $id:expr, $dn:expr $(, ($attr:expr, [$($val:expr),* $(,)?]))* $(,)?) => {{
        let pairs: &[(&str, &[&str])] = &[
            $(($attr, &[$($val),*] as &[&str])),*
        ];
        $crate::entry::Entry::from_pairs($schema, $id, $dn, pairs)
            .expect("invalid test entry")
    }};
}

#[macro_export]
macro_rules! modify {
    ($schema:expr, $op:expr, $attr:expr, [$($val:expr),* $(,)?]) => {{
        let desc = $schema.resolve($attr).expect("unknown test attribute");
        let vals: Vec<$crate::value::Value> = vec![$(
            desc.normalise_value($val).expect("invalid test value")
        ),*];
        $crate::modify::Modify::new($op, desc, vals)
    }};
}

#[macro_export]
macro_rules! modlist {
    ($schema:expr, [$(($op:expr, $attr:expr, [$($val:expr),* $(,)?])),* $(,)?]) => {{
        $crate::modify::ModifyList::new_list(vec![
            $(modify!($schema, $op, $attr, [$($val),*])),*
        ])
    }};
}
