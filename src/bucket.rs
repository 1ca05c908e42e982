//! Resolution buckets the transformer was trained on

use serde::Serialize;

/// Reference resolution of [`BUCKETS_640`]
pub const BUCKET_BASE_RESOLUTION: usize = 640;

/// `(height, width)` buckets at base resolution 640
pub const BUCKETS_640: [(usize, usize); 14] = [
    (416, 960),
    (448, 864),
    (480, 832),
    (512, 768),
    (544, 704),
    (576, 672),
    (608, 640),
    (640, 608),
    (672, 576),
    (704, 544),
    (768, 512),
    (832, 480),
    (864, 448),
    (960, 416),
];

/// Pixel size of a bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Bucket {
    pub width: usize,
    pub height: usize,
}

/// Nearest bucket by aspect ratio for an image of `height` x `width`.
///
/// Minimizes `|h * bucket_w - w * bucket_h|`; on ties the later bucket wins.
/// For other base resolutions the chosen bucket is scaled and rounded to a
/// multiple of 16.
pub fn find_nearest_bucket(height: usize, width: usize, base_resolution: usize) -> Bucket {
    let mut best = BUCKETS_640[0];
    let mut min_metric = u128::MAX;
    for (bucket_h, bucket_w) in BUCKETS_640 {
        let metric = (height as u128 * bucket_w as u128).abs_diff(width as u128 * bucket_h as u128);
        if metric <= min_metric {
            min_metric = metric;
            best = (bucket_h, bucket_w);
        }
    }

    let (bucket_h, bucket_w) = best;
    if base_resolution == BUCKET_BASE_RESOLUTION {
        return Bucket {
            width: bucket_w,
            height: bucket_h,
        };
    }
    let scale = base_resolution as f64 / BUCKET_BASE_RESOLUTION as f64;
    let snap = |v: usize| ((v as f64 * scale / 16.0).round_ties_even() as usize) * 16;
    Bucket {
        width: snap(bucket_w),
        height: snap(bucket_h),
    }
}
