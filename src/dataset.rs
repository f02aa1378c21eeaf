use std::path::Path;

use anyhow::Context;
use burn::data::dataset::vision::ImageFolderDataset;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum COCOVersion {
    V2017,
}

impl COCOVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            COCOVersion::V2017 => "2017",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum COCOSplit {
    Train,
    Val,
}

impl COCOSplit {
    pub fn as_str(&self) -> &'static str {
        match self {
            COCOSplit::Train => "train",
            COCOSplit::Val => "val",
        }
    }
}

/// Annotation file and image directory of a split under the usual COCO layout:
///
/// ```text
///   <root>/annotations/instances_<split><year>.json
///   <root>/<split><year>/
/// ```
pub fn coco_paths(root: &Path, split: COCOSplit, version: COCOVersion) -> (String, String) {
    let name = format!("{}{}", split.as_str(), version.as_str());

    let annotations = root
        .join("annotations")
        .join(format!("instances_{name}.json"));
    let images = root.join(name);

    (
        annotations.to_string_lossy().into_owned(),
        images.to_string_lossy().into_owned(),
    )
}

pub trait COCODataSet: Sized {
    fn coco_ds_train(version: COCOVersion, root: &Path) -> anyhow::Result<Self>;
    fn coco_ds_val(version: COCOVersion, root: &Path) -> anyhow::Result<Self>;
}

fn load(root: &Path, split: COCOSplit, version: COCOVersion) -> anyhow::Result<ImageFolderDataset> {
    let (annotations, images) = coco_paths(root, split, version);

    let ds = ImageFolderDataset::new_coco_detection(&annotations, &images)
        .with_context(|| format!("loading COCO {annotations} with images in {images}"))?;

    log::info!("COCO {} {}: loaded from {}", split.as_str(), version.as_str(), images);

    Ok(ds)
}

impl COCODataSet for ImageFolderDataset {
    /// Creates a new COCO train dataset.
    fn coco_ds_train(version: COCOVersion, root: &Path) -> anyhow::Result<Self> {
        load(root, COCOSplit::Train, version)
    }

    /// Creates a new COCO validation dataset.
    fn coco_ds_val(version: COCOVersion, root: &Path) -> anyhow::Result<Self> {
        load(root, COCOSplit::Val, version)
    }
}
