//! Core HTTP protocol abstractions.
//!
//! - **Messages** (`message`): [`Message`], [`PayloadItem`] and [`PayloadSize`], the items
//!   flowing through the codecs
//! - **Requests** (`request`): [`RequestHeader`] while the body is read, [`Request`] once it
//!   is buffered, plus the keep-alive rules of the request side
//! - **Responses** (`response`): [`Response`], committed once and encoded into a [`BodySink`]
//! - **Ranges** (`range`) and **content negotiation** (`negotiation`)
//! - **Errors** (`error`): [`EngineError`] at the top, [`ParseError`] for requests,
//!   [`SendError`] for responses and [`UsageError`] for API misuse

mod message;
pub use message::Message;
pub use message::PayloadItem;
pub use message::PayloadSize;

mod request;
pub(crate) use request::placeholder_request;
pub use request::{BadRequest, PeerAddr, Request, RequestHeader, has_connection_token, wants_keep_alive};

mod response;
pub use response::{BodySink, Response, ResponseContext, ResponseHead, ResponseOptions, status_allows_body};

mod range;
pub use range::{ByteRangeSpec, RangeSet, ResolvedRange, unsatisfied_content_range};

mod negotiation;
pub use negotiation::{ContentCoding, EncodingPreferences, is_compressible, is_legacy_agent, select_coding};

mod error;
pub use error::BoxError;
pub use error::EngineError;
pub use error::ParseError;
pub use error::SendError;
pub use error::UsageError;
