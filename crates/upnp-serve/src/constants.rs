pub const UPNP_DEVICE_ROOT: &str = "upnp:rootdevice";
pub const UPNP_DEVICE_MEDIARENDERER: &str = "urn:schemas-upnp-org:device:MediaRenderer:1";

pub const SERVICE_TYPE_AV_TRANSPORT: &str = "urn:schemas-upnp-org:service:AVTransport:1";
pub const SERVICE_TYPE_RENDERING_CONTROL: &str =
    "urn:schemas-upnp-org:service:RenderingControl:1";
pub const SERVICE_TYPE_CONNECTION_MANAGER: &str =
    "urn:schemas-upnp-org:service:ConnectionManager:1";

pub const CONTENT_TYPE_XML_UTF8: &str = "text/xml; charset=\"utf-8\"";

/// UPnP's `EXT` header: present, always empty, kept for UPnP 1.0 control
/// points that check for it.
pub const EXT_HEADER_NAME: &str = "ext";
pub const EXT_HEADER_VALUE: &str = "";

pub const DEFAULT_SUBSCRIPTION_TIMEOUT_SECS: u64 = 1800;
pub const MAX_SUBSCRIBER_CONSECUTIVE_ERRORS: u32 = 10;
