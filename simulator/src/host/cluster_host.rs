use std::cell::RefCell;
use std::rc::Rc;

use dslab_compute::multicore::Compute;
use dslab_core::SimulationContext;

use crate::config::sim_config::HostRole;

/// One platform machine: its compute model plus the context that anchors it
/// in the network. Kernel completions are awaited by the executor, so the
/// host itself carries no event handler.
pub struct ClusterHost {
    pub machine_id: u32,
    pub name: String,
    pub role: HostRole,
    /// Core speed in flop/s.
    pub speed: f64,
    pub cores: u32,
    pub compute: Rc<RefCell<Compute>>,
    pub ctx: SimulationContext,
}

impl ClusterHost {
    pub fn new(
        machine_id: u32,
        name: String,
        role: HostRole,
        speed: f64,
        cores: u32,
        compute: Rc<RefCell<Compute>>,
        ctx: SimulationContext,
    ) -> ClusterHost {
        ClusterHost {
            machine_id,
            name,
            role,
            speed,
            cores,
            compute,
            ctx,
        }
    }

    pub fn id(&self) -> dslab_core::Id {
        self.ctx.id()
    }
}
