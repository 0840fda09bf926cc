pub mod bitbuf;
pub mod extended;
pub mod npc_info;
pub mod protocol;
