//! Job side control: the job master and the per pipeline checkpoint coordinator it
//! drives, plus the restart policies it consults.

pub mod checkpoint_coordinator;
pub mod job_master;
pub mod restart;
