//! Row types exchanged with the remote store.
//!
//! Rows cross the [`RemoteStore`](crate::store::RemoteStore) boundary as
//! JSON objects; each model here is the typed `Serialize + Deserialize`
//! view of one table.

pub mod presence;
