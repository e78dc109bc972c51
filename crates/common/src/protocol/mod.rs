// Session protocol shared by the sync server and its clients.

pub mod session;
