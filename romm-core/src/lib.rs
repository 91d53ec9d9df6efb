mod client;

pub use client::{
    ApiErrorClass, ClientOptions, Heartbeat, HeartbeatSystem, NewRomNote, RomNote, RommClient,
    RommError, SaveInfo, SaveUpload,
};
