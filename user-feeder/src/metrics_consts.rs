pub const USERS_READ: &str = "user_feeder_read_total";
pub const READ_ERRORS: &str = "user_feeder_read_errors_total";
pub const USERS_SENT: &str = "user_feeder_sent_total";
pub const SEND_ERRORS: &str = "user_feeder_send_errors_total";
pub const FEED_DURATION: &str = "user_feeder_duration_seconds";

// HTTP push source, labelled by source_ip
pub const API_RECEIVED: &str = "user_feeder_api_received_total";
pub const API_RECEIVE_ERRORS: &str = "user_feeder_api_receive_errors_total";
