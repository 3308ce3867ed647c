pub mod group_index;
pub mod media;
pub mod membership;
pub mod router;
pub mod worker;
