use std::rc::Rc;

use crate::host::cluster_host::ClusterHost;

/// One per-host slice of a running job: the managed compute allocation the
/// executor drives kernel work units through.
pub struct HostProcessInstance {
    pub id: u64,
    pub compute_allocation_id: u64,
    pub host: Rc<ClusterHost>,
}
