//! Hardware-accelerated video decoding.
//!
//! With the `hardware` feature, the FFmpeg backend asks the codec which
//! hardware device types it can decode on, creates a device context for the
//! first one that works, and transfers decoded surfaces back to system memory
//! before conversion. Any failure along the way, including the codec
//! rejecting the device when it opens, is retried in software by the
//! backend without surfacing an error.

use ffmpeg_next::{
    codec::context::Context as CodecContext, decoder::Video as FfmpegVideoDecoder,
    frame::Video as VideoFrame,
};
use ffmpeg_sys_next::{
    AV_CODEC_HW_CONFIG_METHOD_HW_DEVICE_CTX, AVBufferRef, AVCodecContext, AVCodecHWConfig,
    AVHWDeviceType,
};

use crate::error::SnapcacheError;

/// Hardware device types the FFmpeg build may decode on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HardwareDeviceType {
    /// NVIDIA CUDA (Linux, Windows).
    Cuda,
    /// Video Acceleration API (Linux).
    Vaapi,
    /// DirectX Video Acceleration 2 (Windows).
    Dxva2,
    /// Direct3D 11 Video Acceleration (Windows).
    D3d11va,
    /// Apple VideoToolbox (macOS, iOS).
    VideoToolbox,
    /// Intel Quick Sync Video (cross-platform).
    Qsv,
}

impl HardwareDeviceType {
    fn from_av_hw_device_type(device_type: AVHWDeviceType) -> Option<Self> {
        match device_type {
            AVHWDeviceType::AV_HWDEVICE_TYPE_CUDA => Some(HardwareDeviceType::Cuda),
            AVHWDeviceType::AV_HWDEVICE_TYPE_VAAPI => Some(HardwareDeviceType::Vaapi),
            AVHWDeviceType::AV_HWDEVICE_TYPE_DXVA2 => Some(HardwareDeviceType::Dxva2),
            AVHWDeviceType::AV_HWDEVICE_TYPE_D3D11VA => Some(HardwareDeviceType::D3d11va),
            AVHWDeviceType::AV_HWDEVICE_TYPE_VIDEOTOOLBOX => Some(HardwareDeviceType::VideoToolbox),
            AVHWDeviceType::AV_HWDEVICE_TYPE_QSV => Some(HardwareDeviceType::Qsv),
            _ => None,
        }
    }
}

/// List all hardware device types supported by the FFmpeg build.
pub fn available_hardware_devices() -> Vec<HardwareDeviceType> {
    let mut devices = Vec::new();
    let mut device_type = AVHWDeviceType::AV_HWDEVICE_TYPE_NONE;

    loop {
        device_type = unsafe { ffmpeg_sys_next::av_hwdevice_iterate_types(device_type) };
        if device_type == AVHWDeviceType::AV_HWDEVICE_TYPE_NONE {
            break;
        }
        if let Some(device) = HardwareDeviceType::from_av_hw_device_type(device_type) {
            devices.push(device);
        }
    }

    devices
}

/// Open `codec_context` on the first hardware device its codec supports.
///
/// The context is consumed even when this fails, so callers retry in
/// software with a fresh context built from the stream parameters.
pub(crate) fn open_hardware_decoder(
    codec_context: CodecContext,
) -> Result<FfmpegVideoDecoder, SnapcacheError> {
    let av_device_type = find_hardware_device_for_codec(&codec_context).ok_or_else(|| {
        SnapcacheError::DecoderOpen("No hardware decoder for this codec".to_string())
    })?;
    let hardware_device_context = create_hardware_device_context(av_device_type)?;
    unsafe {
        let context_pointer = codec_context.as_ptr() as *mut AVCodecContext;
        (*context_pointer).hw_device_ctx = ffmpeg_sys_next::av_buffer_ref(hardware_device_context);
        let mut hardware_reference = hardware_device_context;
        ffmpeg_sys_next::av_buffer_unref(&mut hardware_reference);
    }

    let decoder = codec_context.decoder().video().map_err(|error| {
        SnapcacheError::DecoderOpen(format!("{av_device_type:?} decoder rejected: {error}"))
    })?;
    log::debug!("Hardware decoding on {av_device_type:?}");
    Ok(decoder)
}

/// Copy a hardware surface to system memory. Frames already in system
/// memory fail the transfer; the caller keeps using the original.
pub(crate) fn transfer_hardware_frame(
    hardware_frame: &VideoFrame,
) -> Result<VideoFrame, SnapcacheError> {
    let mut software_frame = VideoFrame::empty();
    let result = unsafe {
        ffmpeg_sys_next::av_hwframe_transfer_data(
            software_frame.as_mut_ptr(),
            hardware_frame.as_ptr(),
            0,
        )
    };

    if result < 0 {
        let format = unsafe { (*hardware_frame.as_ptr()).format };
        return Err(SnapcacheError::Decode(format!(
            "Hardware frame transfer failed (format={format}, result={result})"
        )));
    }
    unsafe {
        (*software_frame.as_mut_ptr()).pts = (*hardware_frame.as_ptr()).pts;
        (*software_frame.as_mut_ptr()).best_effort_timestamp =
            (*hardware_frame.as_ptr()).best_effort_timestamp;
        (*software_frame.as_mut_ptr()).pkt_dts = (*hardware_frame.as_ptr()).pkt_dts;
    }
    Ok(software_frame)
}

/// First hardware device type the codec can decode on through a device
/// context.
fn find_hardware_device_for_codec(codec_context: &CodecContext) -> Option<AVHWDeviceType> {
    let codec_ptr = unsafe { (*codec_context.as_ptr()).codec };
    if codec_ptr.is_null() {
        return None;
    }

    let mut index: i32 = 0;
    loop {
        let config: *const AVCodecHWConfig =
            unsafe { ffmpeg_sys_next::avcodec_get_hw_config(codec_ptr, index) };
        if config.is_null() {
            return None;
        }

        let methods = unsafe { (*config).methods };
        let device_type = unsafe { (*config).device_type };
        if methods & (AV_CODEC_HW_CONFIG_METHOD_HW_DEVICE_CTX as i32) != 0
            && device_type != AVHWDeviceType::AV_HWDEVICE_TYPE_NONE
        {
            return Some(device_type);
        }
        index += 1;
    }
}

/// Create an FFmpeg hardware device context.
///
/// Returns a raw `AVBufferRef*` that must be freed with `av_buffer_unref`.
fn create_hardware_device_context(
    device_type: AVHWDeviceType,
) -> Result<*mut AVBufferRef, SnapcacheError> {
    let mut hardware_device_context: *mut AVBufferRef = std::ptr::null_mut();

    let result = unsafe {
        ffmpeg_sys_next::av_hwdevice_ctx_create(
            &mut hardware_device_context,
            device_type,
            std::ptr::null(),
            std::ptr::null_mut(),
            0,
        )
    };

    if result < 0 {
        Err(SnapcacheError::DecoderOpen(format!(
            "Failed to create {device_type:?} device context (result={result})"
        )))
    } else {
        Ok(hardware_device_context)
    }
}
