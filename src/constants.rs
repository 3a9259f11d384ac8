//! # System Constants
//!
//! Queue names, reserved output names and message keys shared between the
//! services. Queue names are contracts with the recipes that reference them.

/// Broker queues consumed or produced by the core services
pub mod queues {
    pub const FILEWATCHER: &str = "filewatcher";
    pub const TRIGGER: &str = "trigger";
    pub const ISPYB_CONNECTOR: &str = "ispyb_connector";
    pub const PROCESSING_RECIPE: &str = "processing_recipe";
    pub const HELD: &str = "held";
    pub const PROMETHEUS: &str = "prometheus";
    /// Broadcast destination for wrapper status notifications
    pub const STATUS_TOPIC: &str = "transient_status";

    /// Prefix of the dead-letter queue that receives nacked messages
    pub const DEAD_LETTER_PREFIX: &str = "dlq_";

    /// Name of the dead-letter queue belonging to `queue`
    pub fn dead_letter_queue(queue: &str) -> String {
        format!("{DEAD_LETTER_PREFIX}{queue}")
    }
}

/// Keys of the recipe message envelope
pub mod envelope {
    pub const RECIPE: &str = "recipe";
    pub const RECIPE_POINTER: &str = "recipe-pointer";
    pub const RECIPE_PATH: &str = "recipe-path";
    pub const ENVIRONMENT: &str = "environment";
    pub const PAYLOAD: &str = "payload";
    pub const HEADERS: &str = "headers";

    /// Message header set when a message was moved back out of a dead-letter queue
    pub const DLQ_REINJECTED: &str = "dlq-reinjected";

    /// Environment key marking a synthetic wrapper built around a simple message
    pub const HAS_RECIPE_WRAPPER: &str = "has_recipe_wrapper";
}

/// Output names with special meaning to the filewatcher
pub mod outputs {
    pub const FIRST: &str = "first";
    pub const EVERY: &str = "every";
    pub const LAST: &str = "last";
    pub const ANY: &str = "any";
    pub const FINALLY: &str = "finally";
    pub const TIMEOUT: &str = "timeout";
    pub const ERROR: &str = "error";
    pub const EVERY_PREFIX: &str = "every-";
    pub const SELECT_PREFIX: &str = "select-";

    /// Default channel used by services replying with a result
    pub const OUTPUT: &str = "output";

    /// Wrapper runner outputs
    pub const SUCCESS: &str = "success";
    pub const FAILURE: &str = "failure";
    pub const RESULT_INDIVIDUAL_FILE: &str = "result-individual-file";
    pub const RESULT_ALL_FILES: &str = "result-all-files";
}

/// Environment variables consumed by the runtime
pub mod env {
    /// Broker selector
    pub const TRANSPORT: &str = "DLSTBX_TRANSPORT";
    /// Path of an optional configuration file
    pub const CONFIG_FILE: &str = "DLSTBX_CONFIG";
    /// Verbosity counter, added to the number of `-v` flags
    pub const VERBOSITY: &str = "DLSTBX_VERBOSITY";
    /// Prefix for structured configuration overrides (`DLSTBX__SECTION__KEY`)
    pub const CONFIG_PREFIX: &str = "DLSTBX";
}

/// Message body discriminators
pub mod body {
    pub const ISPYB_COMMAND: &str = "ispyb_command";
    pub const ISPYB_COMMAND_LIST: &str = "ispyb_command_list";
    pub const MULTIPART_MESSAGE: &str = "multipart_message";
    pub const BUFFER: &str = "buffer";
    pub const BUFFER_COMMAND: &str = "buffer_command";
    pub const BUFFER_LOOKUP: &str = "buffer_lookup";
    pub const BUFFER_STORE: &str = "buffer_store";
    pub const BUFFER_EXPIRY_TIME: &str = "buffer_expiry_time";
    pub const CHECKPOINT: &str = "checkpoint";
    pub const STEP_MESSAGE: &str = "step_message";
    pub const STORE_RESULT: &str = "store_result";
    pub const FILEWATCHER_STATUS: &str = "filewatcher-status";
    pub const TRIGGER_STATUS: &str = "trigger-status";
    pub const PARAMETERS: &str = "parameters";
    pub const CONTENT: &str = "content";
}
