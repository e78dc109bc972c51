// mapsync-common: wire types shared by sync servers and their clients

pub mod changeset;
pub mod protocol;
pub mod types;
