//! Built-in RPC commands.

mod data_logger_read;
mod data_receiver;
mod data_sender;
mod echo;
mod states_query;

use std::sync::Arc;

use super::{
    CommandRegistry, RpcError, RPC_ID_DATA_LOGGER_READ, RPC_ID_DATA_RECEIVER,
    RPC_ID_DATA_SENDER, RPC_ID_ECHO, RPC_ID_STATES_QUERY,
};

pub use data_logger_read::{
    DataLoggerRead, DataLoggerReadParams, LAST_BLOCK_NEWEST, LOGGER_FLASH_ONBOARD,
    LOGGER_FLASH_REMOVABLE,
};
pub use data_receiver::DataReceiver;
pub use data_sender::DataSender;
pub use echo::Echo;
pub use states_query::{StatesQuery, STATE_ENTRY_LEN};

/// Register echo, data_sender and data_receiver under their standard IDs.
pub fn register_builtins(registry: &mut CommandRegistry) -> Result<(), RpcError> {
    registry.register(RPC_ID_ECHO, Arc::new(Echo))?;
    registry.register(RPC_ID_DATA_SENDER, Arc::new(DataSender))?;
    registry.register(RPC_ID_DATA_RECEIVER, Arc::new(DataReceiver::default()))?;
    Ok(())
}

/// Register the commands that expose device state: stored logger blocks and
/// application states.
pub fn register_device_commands(
    registry: &mut CommandRegistry,
    logger_read: DataLoggerRead,
    states: StatesQuery,
) -> Result<(), RpcError> {
    registry.register(RPC_ID_DATA_LOGGER_READ, Arc::new(logger_read))?;
    registry.register(RPC_ID_STATES_QUERY, Arc::new(states))?;
    Ok(())
}
