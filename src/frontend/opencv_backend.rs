//! OpenCV implementations of the frontend traits.

use std::time::Instant;

use anyhow::{Context, Result, bail};
use image::GrayImage;
use nalgebra::{Matrix3, Point2, Vector3};
use opencv::calib3d;
use opencv::core::{KeyPoint, Mat, Point2d, Ptr, Rect, Vector};
use opencv::features2d;
use opencv::prelude::*;

use super::{
    Descriptors, FeatureExtractor, Features, FrontendConfig, Match, PoseEstimator,
    adaptive_iterations, sampling_confidence,
};
use crate::model::{EstimatorResult, EstimatorType, FeatureType};

/// Minimal sample of the five-point solver.
const SAMPLE_SIZE: usize = 5;

enum Detector {
    Orb(Ptr<features2d::ORB>),
    Sift(Ptr<features2d::SIFT>),
    Akaze(Ptr<features2d::AKAZE>),
    Brisk(Ptr<features2d::BRISK>),
}

pub struct OpenCvExtractor {
    detector: Detector,
    max_features: usize,
}

impl OpenCvExtractor {
    pub fn new(feature_type: FeatureType, config: &FrontendConfig) -> Result<Self> {
        let detector = match feature_type {
            FeatureType::Orb => Detector::Orb(features2d::ORB::create(
                config.max_features as i32,
                1.2,
                8,
                31,
                0,
                2,
                features2d::ORB_ScoreType::HARRIS_SCORE,
                31,
                20,
            )?),
            FeatureType::Sift => Detector::Sift(features2d::SIFT::create_def()?),
            FeatureType::Akaze => Detector::Akaze(features2d::AKAZE::create_def()?),
            FeatureType::Brisk => Detector::Brisk(features2d::BRISK::create_def()?),
        };
        Ok(Self {
            detector,
            max_features: config.max_features,
        })
    }
}

fn to_mat(image: &GrayImage) -> Result<Mat> {
    let (w, h) = image.dimensions();
    let flat = Mat::from_slice(image.as_raw())?;
    let mat = flat.reshape(1, h as i32)?.try_clone()?;
    if mat.cols() != w as i32 {
        bail!("image reshape produced {} columns, expected {}", mat.cols(), w);
    }
    Ok(mat)
}

impl FeatureExtractor for OpenCvExtractor {
    fn extract(&mut self, image: &GrayImage) -> Result<Features> {
        let mat = to_mat(image)?;
        let mask = Mat::default();
        let mut keypoints = Vector::<KeyPoint>::new();
        let mut descriptors = Mat::default();
        match &mut self.detector {
            Detector::Orb(d) => {
                d.detect_and_compute(&mat, &mask, &mut keypoints, &mut descriptors, false)?
            }
            Detector::Sift(d) => {
                d.detect_and_compute(&mat, &mask, &mut keypoints, &mut descriptors, false)?
            }
            Detector::Akaze(d) => {
                d.detect_and_compute(&mat, &mask, &mut keypoints, &mut descriptors, false)?
            }
            Detector::Brisk(d) => {
                d.detect_and_compute(&mat, &mask, &mut keypoints, &mut descriptors, false)?
            }
        }

        // Detectors without a feature cap keep their strongest responses.
        let mut order: Vec<usize> = (0..keypoints.len()).collect();
        if order.len() > self.max_features {
            let responses: Vec<f32> = keypoints.iter().map(|k| k.response()).collect();
            order.sort_by(|&a, &b| responses[b].total_cmp(&responses[a]));
            order.truncate(self.max_features);
        }

        let points = order
            .iter()
            .map(|&i| {
                let kp = keypoints.get(i)?;
                Ok(Point2::new(kp.pt().x as f64, kp.pt().y as f64))
            })
            .collect::<Result<Vec<_>>>()?;

        let descriptors = if descriptors.empty() {
            Descriptors::Binary(Vec::new())
        } else if descriptors.depth() == opencv::core::CV_8U {
            Descriptors::Binary(
                order
                    .iter()
                    .map(|&i| Ok(descriptors.at_row::<u8>(i as i32)?.to_vec()))
                    .collect::<Result<_>>()?,
            )
        } else {
            Descriptors::Float(
                order
                    .iter()
                    .map(|&i| Ok(descriptors.at_row::<f32>(i as i32)?.to_vec()))
                    .collect::<Result<_>>()?,
            )
        };

        Ok(Features {
            keypoints: points,
            descriptors,
        })
    }
}

pub struct EssentialMatrixEstimator {
    method: i32,
    threshold: f64,
    confidence: f64,
    max_iterations: u32,
}

impl EssentialMatrixEstimator {
    pub fn new(estimator_type: EstimatorType, config: &FrontendConfig) -> Self {
        let method = match estimator_type {
            EstimatorType::Ransac => calib3d::RANSAC,
            EstimatorType::Lmeds => calib3d::LMEDS,
            EstimatorType::Magsac => calib3d::USAC_MAGSAC,
            EstimatorType::Prosac => calib3d::USAC_PROSAC,
            EstimatorType::UsacDefault => calib3d::USAC_DEFAULT,
        };
        Self {
            method,
            threshold: config.ransac_threshold,
            confidence: config.ransac_confidence,
            max_iterations: config.max_iterations,
        }
    }
}

fn mat3_to_matrix3(mat: &Mat) -> Result<Matrix3<f64>> {
    let mut m = Matrix3::zeros();
    for r in 0..3 {
        for c in 0..3 {
            m[(r, c)] = *mat.at_2d::<f64>(r as i32, c as i32)?;
        }
    }
    Ok(m)
}

impl PoseEstimator for EssentialMatrixEstimator {
    fn estimate(
        &mut self,
        points1: &[Point2<f64>],
        points2: &[Point2<f64>],
        matches: &[Match],
        intrinsics: &Matrix3<f64>,
    ) -> Result<EstimatorResult> {
        let start = Instant::now();
        if matches.len() < SAMPLE_SIZE {
            bail!("{} matches, five-point solver needs {}", matches.len(), SAMPLE_SIZE);
        }

        let mut pts1 = Vector::<Point2d>::with_capacity(matches.len());
        let mut pts2 = Vector::<Point2d>::with_capacity(matches.len());
        for m in matches {
            let p1 = points1.get(m.query).context("match query index out of range")?;
            let p2 = points2.get(m.train).context("match train index out of range")?;
            pts1.push(Point2d::new(p1.x, p1.y));
            pts2.push(Point2d::new(p2.x, p2.y));
        }

        let k = intrinsics;
        let camera_matrix = Mat::from_slice_2d(&[
            [k[(0, 0)], k[(0, 1)], k[(0, 2)]],
            [k[(1, 0)], k[(1, 1)], k[(1, 2)]],
            [k[(2, 0)], k[(2, 1)], k[(2, 2)]],
        ])?
        .try_clone()?;

        let mut mask = Mat::default();
        let e = calib3d::find_essential_mat(
            &pts1,
            &pts2,
            &camera_matrix,
            self.method,
            self.confidence,
            self.threshold,
            self.max_iterations as i32,
            &mut mask,
        )?;
        if e.rows() < 3 || e.cols() != 3 {
            bail!("no essential matrix found");
        }
        // Several stacked solutions may come back; keep the first.
        let e = Mat::roi(&e, Rect::new(0, 0, 3, 3))?.try_clone()?;

        let mut r = Mat::default();
        let mut t = Mat::default();
        let good = calib3d::recover_pose_estimated(
            &e,
            &pts1,
            &pts2,
            &camera_matrix,
            &mut r,
            &mut t,
            &mut mask,
        )?;
        if good <= 0 {
            bail!("no points in front of both cameras");
        }

        let inlier_mask = (0..matches.len())
            .map(|i| Ok(*mask.at::<u8>(i as i32)? != 0))
            .collect::<Result<Vec<bool>>>()?;
        let rotation = mat3_to_matrix3(&r)?;
        let translation = Vector3::new(
            *t.at::<f64>(0)?,
            *t.at::<f64>(1)?,
            *t.at::<f64>(2)?,
        );

        let ratio = inlier_mask.iter().filter(|m| **m).count() as f64 / matches.len() as f64;
        let iterations =
            adaptive_iterations(ratio, self.confidence, SAMPLE_SIZE).min(self.max_iterations);
        Ok(EstimatorResult {
            inlier_mask,
            rotation,
            translation,
            iterations,
            confidence: sampling_confidence(ratio, iterations, SAMPLE_SIZE),
            estimation_time_ms: start.elapsed().as_secs_f64() * 1000.0,
        })
    }
}
