//! The fixed burst of device-state payloads a switcher pushes to every newly connected
//!  controller, one payload per packet, numbered 1 through 14 in this order. A controller
//!  is not considered operational by the device family until the final
//!  initialization-complete marker went out.
//!
//! The payload content is owned by the application layer (each entry is one command block:
//!  two reserved bytes, a four-character command code, command data). This layer treats the
//!  payloads as opaque constants and only guarantees their order and numbering.

const FIRMWARE_VERSION: &[u8] = b"\x00\x00_ver\x00\x02\x00\x1c";
const PRODUCT_NAME: &[u8] = b"\x00\x00_pinTelevision Studio\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00";
const TOPOLOGY: &[u8] = b"\x00\x00_top\x01\x08\x02\x01\x01\x01\x00\x01\x00\x01\x00\x00";
const MIX_EFFECT_CONFIG: &[u8] = b"\x00\x00_MeC\x00\x0a\x00\x00";
const MEDIA_POOL_CONFIG: &[u8] = b"\x00\x00_mpl\x14\x02\x00\x00";
const MULTI_VIEW_CONFIG: &[u8] = b"\x00\x00_MvC\x01\x0a\x00\x00";
const SUPER_SOURCE_CONFIG: &[u8] = b"\x00\x00_SSC\x04\x00\x00\x00";
const TALLY_CHANNEL_CONFIG: &[u8] = b"\x00\x00_TlC\x00\x00\x00\x00\x08\x00\x00\x00";
const AUDIO_MIXER_CONFIG: &[u8] = b"\x00\x00_AMC\x0c\x01\x00\x00";
const VIDEO_MODE_CONFIG: &[u8] = b"\x00\x00_VMC\x00\x00\x3f\xff\xff\xff\x00\x00";
const MACRO_POOL_CONFIG: &[u8] = b"\x00\x00_MAC\x64\x00\x00\x00";
const POWER_STATUS: &[u8] = b"\x00\x00Powr\x01\x00\x00\x00";
const TIME_OF_DAY: &[u8] = b"\x00\x00Time\x00\x00\x00\x00\x00\x00\x00\x00";
const INIT_COMPLETE: &[u8] = b"\x00\x00InCm\x01\x00\x00\x00";

pub const INITIAL_STATE: [&[u8]; 14] = [
    FIRMWARE_VERSION,
    PRODUCT_NAME,
    TOPOLOGY,
    MIX_EFFECT_CONFIG,
    MEDIA_POOL_CONFIG,
    MULTI_VIEW_CONFIG,
    SUPER_SOURCE_CONFIG,
    TALLY_CHANNEL_CONFIG,
    AUDIO_MIXER_CONFIG,
    VIDEO_MODE_CONFIG,
    MACRO_POOL_CONFIG,
    POWER_STATUS,
    TIME_OF_DAY,
    INIT_COMPLETE,
];
