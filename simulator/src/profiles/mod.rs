pub mod profile;
pub mod registry;

pub use profile::{Profile, ProfileData};
pub use registry::ProfileRegistry;

use std::rc::Rc;

pub type ProfileHandle = Rc<Profile>;
