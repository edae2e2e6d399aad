pub(crate) fn metric_name(name: &str) -> String {
    format!("acl_reconciler_{}", name)
}
