pub const APP_ID_BASE: &str = "dev.rommdeck";

pub const DBUS_NAME_SAVE_SYNC: &str = "dev.rommdeck.SaveSync1";
pub const DBUS_INTERFACE_SAVE_SYNC: &str = "dev.rommdeck.SaveSync1";
pub const DBUS_OBJECT_PATH_SAVE_SYNC: &str = "/dev/rommdeck/SaveSync1";

pub const DBUS_ERROR_NOT_FOUND: &str = "dev.rommdeck.SaveSync1.Error.NotFound";
pub const DBUS_ERROR_BUSY: &str = "dev.rommdeck.SaveSync1.Error.Busy";
pub const DBUS_ERROR_INVALID_ARGUMENT: &str = "dev.rommdeck.SaveSync1.Error.InvalidArgument";
pub const DBUS_ERROR_TRANSFER_FAILED: &str = "dev.rommdeck.SaveSync1.Error.TransferFailed";
pub const DBUS_ERROR_FAILED: &str = "dev.rommdeck.SaveSync1.Error.Failed";

pub const DATA_DIR_NAME: &str = "romm-deck";
pub const DATABASE_FILE_NAME: &str = "save_sync.db";
