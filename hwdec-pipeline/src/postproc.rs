//! Choice between no post-processing, the decoder's internal scaler, and an
//! external post-process stage

use crate::config::{DecoderPostProc, PostProcRequest};
use crate::types::{CodecKind, FrameInfo, PicStruct, PixelFormat, StreamParams};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostProcPlan {
    None,
    /// The decoder writes the transformed output itself
    Internal,
    /// A second hardware stage with its own surface pool
    External,
}

impl PostProcPlan {
    /// Resolve the plan for a stream. Precedence, first match wins:
    ///
    /// | needs resize/color/deinterlace | deinterlace | internal preferred | AVC/HEVC | progressive | plan     |
    /// |--------------------------------|-------------|--------------------|----------|-------------|----------|
    /// | no                             | -           | -                  | -        | -           | None     |
    /// | yes                            | no          | Auto/Force         | yes      | yes         | Internal |
    /// | yes                            | -           | -                  | -        | -           | External |
    pub fn resolve(stream: &StreamParams, request: &PostProcRequest) -> Self {
        let frame = &stream.frame;

        let resize = match request.output_size {
            Some((w, h)) => w != frame.crop_w || h != frame.crop_h,
            None => false,
        };

        let color = match request.output_format {
            // JPEG decoders emit NV12 or RGB4 natively
            Some(format) if stream.codec == CodecKind::Jpeg => {
                format != PixelFormat::NV12 && format != PixelFormat::RGB4
            }
            Some(format) => format.fourcc() != frame.fourcc,
            None => false,
        };

        if !(resize || color || request.deinterlace) {
            return PostProcPlan::None;
        }

        let internal_capable = matches!(stream.codec, CodecKind::Avc | CodecKind::Hevc)
            && frame.pic_struct == PicStruct::Progressive as u32;
        if request.decoder_postproc != DecoderPostProc::Off
            && internal_capable
            && !request.deinterlace
        {
            return PostProcPlan::Internal;
        }

        PostProcPlan::External
    }

    /// Format a JPEG decoder is asked to write itself. NV12 and RGB4 need no
    /// post-process stage.
    pub fn decoder_format(stream: &StreamParams, request: &PostProcRequest) -> Option<PixelFormat> {
        match request.output_format {
            Some(format @ (PixelFormat::NV12 | PixelFormat::RGB4))
                if stream.codec == CodecKind::Jpeg =>
            {
                Some(format)
            }
            _ => None,
        }
    }

    /// Geometry of the transformed output
    pub fn output_info(stream: &StreamParams, request: &PostProcRequest) -> FrameInfo {
        let frame = &stream.frame;
        let (w, h) = request.output_size.unwrap_or((frame.crop_w, frame.crop_h));
        let format = request
            .output_format
            .or_else(|| frame.format())
            .unwrap_or(PixelFormat::NV12);
        FrameInfo::new(w, h, format)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream(codec: CodecKind) -> StreamParams {
        StreamParams {
            codec,
            frame: FrameInfo::new(1920, 1080, PixelFormat::NV12),
        }
    }

    #[test]
    fn test_nothing_requested() {
        let request = PostProcRequest {
            output_size: Some((1920, 1080)),
            output_format: Some(PixelFormat::NV12),
            ..Default::default()
        };
        assert_eq!(
            PostProcPlan::resolve(&stream(CodecKind::Avc), &request),
            PostProcPlan::None
        );
    }

    #[test]
    fn test_resize_prefers_internal_for_avc_hevc() {
        let request = PostProcRequest {
            output_size: Some((1280, 720)),
            decoder_postproc: DecoderPostProc::Auto,
            ..Default::default()
        };
        assert_eq!(
            PostProcPlan::resolve(&stream(CodecKind::Hevc), &request),
            PostProcPlan::Internal
        );
        assert_eq!(
            PostProcPlan::resolve(&stream(CodecKind::Vp9), &request),
            PostProcPlan::External
        );
    }

    #[test]
    fn test_deinterlace_always_external() {
        let request = PostProcRequest {
            deinterlace: true,
            decoder_postproc: DecoderPostProc::Force,
            ..Default::default()
        };
        assert_eq!(
            PostProcPlan::resolve(&stream(CodecKind::Avc), &request),
            PostProcPlan::External
        );
    }

    #[test]
    fn test_jpeg_native_formats() {
        let rgb = PostProcRequest {
            output_format: Some(PixelFormat::RGB4),
            ..Default::default()
        };
        assert_eq!(
            PostProcPlan::resolve(&stream(CodecKind::Jpeg), &rgb),
            PostProcPlan::None
        );

        assert_eq!(
            PostProcPlan::decoder_format(&stream(CodecKind::Jpeg), &rgb),
            Some(PixelFormat::RGB4)
        );
        assert_eq!(PostProcPlan::decoder_format(&stream(CodecKind::Avc), &rgb), None);

        let yuy2 = PostProcRequest {
            output_format: Some(PixelFormat::YUY2),
            ..Default::default()
        };
        assert_eq!(
            PostProcPlan::resolve(&stream(CodecKind::Jpeg), &yuy2),
            PostProcPlan::External
        );
    }

    #[test]
    fn test_interlaced_stream_skips_decoder_scaler() {
        let mut interlaced = stream(CodecKind::Avc);
        interlaced.frame.pic_struct = PicStruct::FieldTff as u32;
        let request = PostProcRequest {
            output_size: Some((1280, 720)),
            decoder_postproc: DecoderPostProc::Force,
            ..Default::default()
        };
        assert_eq!(
            PostProcPlan::resolve(&interlaced, &request),
            PostProcPlan::External
        );
        assert_eq!(
            PostProcPlan::resolve(&stream(CodecKind::Avc), &request),
            PostProcPlan::Internal
        );
    }

    #[test]
    fn test_output_info() {
        let request = PostProcRequest {
            output_size: Some((640, 360)),
            output_format: Some(PixelFormat::RGB4),
            ..Default::default()
        };
        let info = PostProcPlan::output_info(&stream(CodecKind::Avc), &request);
        assert_eq!((info.crop_w, info.crop_h), (640, 360));
        assert_eq!(info.height, 368);
        assert_eq!(info.format(), Some(PixelFormat::RGB4));
    }
}
