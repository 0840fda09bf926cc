pub mod config;
pub mod entities;
pub mod net;
pub mod telemetry;
pub mod world;

pub use config::ProtocolConfig;
pub use entities::avatar::{NpcAvatar, Priority};
pub use entities::repository::{AvatarKey, AvatarRepository, RepositoryError, INDEX_SENTINEL};
pub use net::bitbuf::{BitBuf, CodecError, CodecMode};
pub use net::extended::{ClientKind, ExtendedInfoEncoder, NullEncoder};
pub use net::npc_info::{
    NpcInfo, NpcInfoError, ObserverFault, VisibilityFilter, ROOT_WORLD,
};
pub use net::protocol::{NpcProtocol, ProtocolError, TickStats, MAX_OBSERVERS};
pub use world::position::{BuildArea, CoordGrid, StepDir};
pub use world::zones::{DiscoverySupplier, ZoneGrid, ZoneIndex};
