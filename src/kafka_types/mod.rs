mod event;

pub use event::{ChannelEvent, CLOUDEVENT_HEADER_PREFIX, CONTENT_TYPE_HEADER};
