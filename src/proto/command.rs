use std::fmt;

use crate::frame::FramingError;

macro_rules! commands {
    ($($variant:ident = $code:literal => $name:literal,)+) => {
        /// Closed set of operation codes understood by the device firmware.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Command {
            $($variant,)+
        }

        impl Command {
            pub const ALL: &'static [Command] = &[$(Command::$variant,)+];

            pub const fn code(self) -> u16 {
                match self {
                    $(Command::$variant => $code,)+
                }
            }

            pub const fn name(self) -> &'static str {
                match self {
                    $(Command::$variant => $name,)+
                }
            }
        }

        impl TryFrom<u16> for Command {
            type Error = FramingError;

            fn try_from(code: u16) -> Result<Self, Self::Error> {
                match code {
                    $($code => Ok(Command::$variant),)+
                    other => Err(FramingError::UnknownCommand(other)),
                }
            }
        }
    };
}

commands! {
    // ---- Memory / link
    NoOp = 0x0000 => "none",
    MemRead = 0x0001 => "mem-read",
    MemWrite = 0x0002 => "mem-write",
    Data = 0x0003 => "data",
    AckNack = 0x0004 => "ack-nack",
    StsClr = 0x0005 => "sts-clr",
    MemClr = 0x0006 => "mem-clr",
    CrcErr = 0x0007 => "crc-err",
    TestEcho = 0x0008 => "test-echo",
    FileWrite = 0x0009 => "file-write",
    FlashMemWrite = 0x000A => "flash-mem-write",

    // ---- System
    Reset = 0x0020 => "reset",
    SystemStatus = 0x0021 => "system-status",
    UpdateFw = 0x0022 => "update-fw",
    UpdateModel = 0x0023 => "update-model",
    Reserved = 0x0024 => "reserved",
    GetKnNum = 0x0025 => "get-kn-num",
    GetModelInfo = 0x0026 => "get-model-info",
    SetCkey = 0x0027 => "set-ckey",
    GetCrc = 0x0028 => "get-crc",

    // ---- Application
    QueryApps = 0x0030 => "query-apps",
    SelectApp = 0x0031 => "select-app",
    SetMode = 0x0032 => "set-mode",
    SetEvents = 0x0033 => "set-events",
    Update = 0x0034 => "update",
    ImgResult = 0x0035 => "img-result",
    Abort = 0x0036 => "abort",

    // ---- Face ID
    SfidStart = 0x0108 => "sfid-start",
    SfidNewUser = 0x0109 => "sfid-new-user",
    SfidAddDb = 0x010A => "sfid-add-db",
    SfidDeleteDb = 0x010B => "sfid-delete-db",
    SfidSendImage = 0x010C => "sfid-send-image",
    SfidReserve1 = 0x010D => "sfid-reserve-1",
    SfidReserve2 = 0x010E => "sfid-reserve-2",
    SfidEditDb = 0x010F => "sfid-edit-db",

    // ---- Dynamic model execution
    DmeStart = 0x0118 => "dme-start",
    DmeConfig = 0x0119 => "dme-config",
    DmeSendImage = 0x011A => "dme-send-image",
    DmeGetStatus = 0x011B => "dme-get-status",

    // ---- Image streaming
    IsiStart = 0x0138 => "isi-start",
    IsiSendImage = 0x0139 => "isi-send-image",
    IsiGetResults = 0x013A => "isi-get-results",
    IsiConfig = 0x013B => "isi-config",

    // ---- JPEG codec
    JpegEncConfig = 0x0200 => "jpeg-enc-config",
    JpegEnc = 0x0201 => "jpeg-enc",
    JpegEncGetResult = 0x0202 => "jpeg-enc-get-result",
    JpegDecConfig = 0x0203 => "jpeg-dec-config",
    JpegDec = 0x0204 => "jpeg-dec",
    JpegDecGetResult = 0x0205 => "jpeg-dec-get-result",

    // ---- Flash
    FlashInfo = 0x1000 => "flash-info",
    FlashChipErase = 0x1001 => "flash-chip-erase",
    FlashSectorErase = 0x1002 => "flash-sector-erase",
    FlashRead = 0x1003 => "flash-read",
    FlashWrite = 0x1004 => "flash-write",

    // ---- Camera tool
    DownloadImageNir = 0x2100 => "download-image-nir",
    DownloadImageRgb = 0x2101 => "download-image-rgb",
    SetNirAgc = 0x2102 => "set-nir-agc",
    SetNirAec = 0x2103 => "set-nir-aec",
    SetRgbAgc = 0x2104 => "set-rgb-agc",
    SetRgbAec = 0x2105 => "set-rgb-aec",
    SetNirLed = 0x2106 => "set-nir-led",
    SetRgbLed = 0x2107 => "set-rgb-led",
    CamConnect = 0x2108 => "cam-connect",
    NirFdRes = 0x2109 => "nir-fd-res",
    NirLmRes = 0x210A => "nir-lm-res",
    RgbFdRes = 0x210B => "rgb-fd-res",
    RgbLmRes = 0x210C => "rgb-lm-res",
    NirGetConf = 0x210D => "nir-get-conf",
    RgbGetConf = 0x210E => "rgb-get-conf",
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({:#06x})", self.name(), self.code())
    }
}
