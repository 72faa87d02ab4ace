pub mod bitfield;

pub mod files;
pub mod metainfo;
pub mod piece;
pub mod torrent;
pub mod utils;

pub mod tracker {
    pub mod announce;
    pub mod http;
    pub mod udp;
}

pub mod peer {
    pub mod message;
    pub mod session;
}
