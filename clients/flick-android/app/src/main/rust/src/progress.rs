// Forwards engine progress to a Kotlin ProgressListener

use flick_core::ProgressSink;
use jni::JNIEnv;
use jni::objects::{JObject, JValue};
use std::cell::RefCell;

/// Calls `listener.onProgress(long)` on the thread running the engine
///
/// The engine runs synchronously on the JVM thread that made the JNI call,
/// so the `JNIEnv` stays valid for the sink's whole life.
pub struct JniProgress<'a, 'local> {
    env: RefCell<&'a mut JNIEnv<'local>>,
    listener: &'a JObject<'local>,
}

impl<'a, 'local> JniProgress<'a, 'local> {
    pub fn new(env: &'a mut JNIEnv<'local>, listener: &'a JObject<'local>) -> Self {
        Self {
            env: RefCell::new(env),
            listener,
        }
    }
}

impl ProgressSink for JniProgress<'_, '_> {
    fn on_progress(&self, bytes: u64) {
        if self.listener.is_null() {
            return;
        }
        let Ok(mut env) = self.env.try_borrow_mut() else {
            return;
        };

        let bytes = i64::try_from(bytes).unwrap_or(i64::MAX);
        if let Err(e) = env.call_method(self.listener, "onProgress", "(J)V", &[JValue::Long(bytes)]) {
            log::warn!("onProgress callback failed: {e}");
            // A pending Java exception would poison every later JNI call
            if env.exception_check().unwrap_or(false) {
                let _ = env.exception_clear();
            }
        }
    }
}
