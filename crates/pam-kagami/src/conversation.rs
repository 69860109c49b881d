use std::ffi::{c_void, CString};
use std::ptr;

use libc::{c_int, free};
use pam_sys::{
    get_item, ConvClosure, PamConversation, PamHandle, PamItemType, PamMessage, PamMessageStyle,
    PamResponse, PamReturnCode,
};

use crate::logger::PamLogger;

/// Sends informational and error lines through the application's PAM
/// conversation callback, if it registered one.
pub(crate) struct PamConversationMessenger {
    conv: Option<ConvClosure>,
    data_ptr: *mut c_void,
}

impl PamConversationMessenger {
    /// # Safety
    /// `pamh` must be null or a live PAM handle.
    pub(crate) unsafe fn new(pamh: *mut PamHandle, logger: &PamLogger) -> Self {
        if pamh.is_null() {
            logger.warn("PAM handle was null; conversation messages disabled");
            return Self::without_callback();
        }

        let handle = &*pamh;
        let mut item: *const c_void = ptr::null();
        let rc = get_item(handle, PamItemType::CONV, &mut item);
        if rc != PamReturnCode::SUCCESS {
            logger.warn(&format!("pam_get_item(PAM_CONV) failed: {rc}"));
            return Self::without_callback();
        }
        if item.is_null() {
            logger.warn("PAM provided no conversation struct; interactive hints disabled");
            return Self::without_callback();
        }

        let conv_struct = &*(item as *const PamConversation);
        match conv_struct.conv {
            Some(callback) => Self {
                conv: Some(callback),
                data_ptr: conv_struct.data_ptr,
            },
            None => {
                logger.warn("PAM conversation struct lacked a callback; interactive hints disabled");
                Self::without_callback()
            }
        }
    }

    fn without_callback() -> Self {
        Self {
            conv: None,
            data_ptr: ptr::null_mut(),
        }
    }

    pub(crate) fn send(&mut self, logger: &PamLogger, style: PamMessageStyle, message: &str) {
        let Some(callback) = self.conv else {
            return;
        };
        let Ok(c_message) = CString::new(message) else {
            logger.warn("PAM conversation message contained an interior null byte; skipped");
            return;
        };

        let mut pam_message = PamMessage {
            msg_style: style as c_int,
            msg: c_message.as_ptr(),
        };
        let mut pam_message_ptr: *mut PamMessage = &mut pam_message;
        let mut response_ptr: *mut PamResponse = ptr::null_mut();
        let status = callback(1, &mut pam_message_ptr, &mut response_ptr, self.data_ptr);
        unsafe {
            if !response_ptr.is_null() {
                if !(*response_ptr).resp.is_null() {
                    free((*response_ptr).resp as *mut c_void);
                }
                free(response_ptr as *mut c_void);
            }
        }

        if status != PamReturnCode::SUCCESS as c_int {
            let code = PamReturnCode::from(status);
            logger.warn(&format!(
                "PAM conversation callback returned {code:?} while sending {style:?}"
            ));
        }
    }

    #[cfg(test)]
    pub(crate) fn from_callback(callback: ConvClosure) -> Self {
        Self {
            conv: Some(callback),
            data_ptr: ptr::null_mut(),
        }
    }
}
