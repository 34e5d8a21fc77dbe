use core::marker::PhantomData;

use anyhow::anyhow;
use esp_idf_svc::sys::{
    camera::{
        camera_config_t, camera_config_t__bindgen_ty_1, camera_config_t__bindgen_ty_2,
        camera_fb_t, esp_camera_fb_get, esp_camera_fb_return, esp_camera_init,
    },
    EspError,
};
use log::info;

use edgecam_common::{FrameSource, PipelineError};

/// OV2640 on the AI-Thinker ESP32-CAM board.
pub struct Esp32Camera {
    _private: (),
}

impl Esp32Camera {
    pub fn init() -> anyhow::Result<Self> {
        let config = ai_thinker_config();
        let rc = unsafe { esp_camera_init(&config) };
        EspError::convert(rc).map_err(|err| anyhow!("esp_camera_init failed: {err}"))?;

        info!("camera initialized: VGA JPEG, 1 frame buffer");
        Ok(Self { _private: () })
    }
}

/// Borrowed driver frame buffer, handed back to the driver on drop.
pub struct CameraFrame<'a> {
    fb: *mut camera_fb_t,
    _camera: PhantomData<&'a mut Esp32Camera>,
}

impl AsRef<[u8]> for CameraFrame<'_> {
    fn as_ref(&self) -> &[u8] {
        unsafe {
            let fb = &*self.fb;
            if fb.buf.is_null() {
                return &[];
            }
            core::slice::from_raw_parts(fb.buf, fb.len)
        }
    }
}

impl Drop for CameraFrame<'_> {
    fn drop(&mut self) {
        unsafe { esp_camera_fb_return(self.fb) }
    }
}

impl FrameSource for Esp32Camera {
    type Frame<'a> = CameraFrame<'a>;

    fn capture(&mut self) -> Result<Self::Frame<'_>, PipelineError> {
        let fb = unsafe { esp_camera_fb_get() };
        if fb.is_null() {
            return Err(PipelineError::Capture(
                "esp_camera_fb_get returned no buffer".to_string(),
            ));
        }
        Ok(CameraFrame {
            fb,
            _camera: PhantomData,
        })
    }
}

fn ai_thinker_config() -> camera_config_t {
    camera_config_t {
        pin_pwdn: 32,
        pin_reset: -1,
        pin_xclk: 0,
        __bindgen_anon_1: camera_config_t__bindgen_ty_1 { pin_sccb_sda: 26 },
        __bindgen_anon_2: camera_config_t__bindgen_ty_2 { pin_sccb_scl: 27 },
        pin_d7: 35,
        pin_d6: 34,
        pin_d5: 39,
        pin_d4: 36,
        pin_d3: 21,
        pin_d2: 19,
        pin_d1: 18,
        pin_d0: 5,
        pin_vsync: 25,
        pin_href: 23,
        pin_pclk: 22,
        xclk_freq_hz: 20_000_000,
        ledc_timer: 0,
        ledc_channel: 0,
        // PIXFORMAT_JPEG, FRAMESIZE_VGA
        pixel_format: 4,
        frame_size: 8,
        jpeg_quality: 12,
        fb_count: 1,
        // grab when empty, frame buffer in PSRAM
        grab_mode: 0,
        fb_location: 0,
        sccb_i2c_port: 0,
    }
}
