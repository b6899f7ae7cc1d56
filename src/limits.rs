// Hard caps on state growth and request sizes. Mutations that would
// cross one of these fail with `limit_exceeded` instead of growing
// process memory without bound.

/// Maximum resource calendars held by one process.
pub const MAX_RESOURCES: usize = 10_000;

/// Maximum windows in one week template.
pub const MAX_TEMPLATE_WINDOWS: usize = 64;

/// Maximum per-slot overrides tracked on one resource.
pub const MAX_OVERRIDES_PER_RESOURCE: usize = 100_000;

/// Maximum holder token length in bytes.
pub const MAX_HOLDER_TOKEN_LEN: usize = 128;

/// Shortest slot a template window may declare, in minutes.
pub const MIN_SLOT_MINUTES: u32 = 5;

/// Longest slot a template window may declare, in minutes.
pub const MAX_SLOT_MINUTES: u32 = 480;

/// Widest snapshot horizon a client may request, in days.
pub const MAX_SNAPSHOT_DAYS: u32 = 60;

/// Maximum serialized booking payload accepted on confirm, in bytes.
pub const MAX_BOOKING_PAYLOAD_BYTES: usize = 16 * 1024;

/// Longest line accepted from the event stream, client side.
pub const MAX_EVENT_LINE_BYTES: usize = 64 * 1024;
