// Wire protocol shared by the server and its clients.

pub mod ws;
