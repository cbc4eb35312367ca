// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use ::flexi_logger::Logger;
use ::std::sync::Once;

//==============================================================================
// Static Variables
//==============================================================================

/// Guardian to the logging initialize function.
static INIT_LOG: Once = Once::new();

//==============================================================================
// Standalone Functions
//==============================================================================

/// Initializes logging features. The log filter is read from the `RUST_LOG` environment variable and defaults
/// to `info`.
pub fn initialize() {
    INIT_LOG.call_once(|| {
        match Logger::try_with_env_or_str("info") {
            Ok(logger) => {
                // Another logger may already be installed by the host application.
                if let Err(e) = logger.start() {
                    eprintln!("initialize(): failed to start logger ({:?})", e);
                }
            },
            Err(e) => eprintln!("initialize(): bad log filter ({:?})", e),
        }
    });
}
