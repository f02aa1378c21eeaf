use crate::error::ConfigError;

/// The 80 annotated COCO categories with their dataset ids.
///
/// COCO lists 91 ids but only 80 of them carry annotations, so the ids are sparse ("street
/// sign", "hat", "shoe", ... never occur).
///
/// “Microsoft COCO: Common Objects in Context”
/// Tsung-Yi Lin, Michael Maire, Serge Belongie, Lubomir Bourdev, Ross Girshick, James Hays, Pietro
/// Perona, Deva Ramanan, C. Lawrence Zitnick, Piotr Dollár
/// https://arxiv.org/abs/1405.0312
pub const COCO_CATEGORIES: [(usize, &str); 80] = [
    (1, "person"),
    (2, "bicycle"),
    (3, "car"),
    (4, "motorcycle"),
    (5, "airplane"),
    (6, "bus"),
    (7, "train"),
    (8, "truck"),
    (9, "boat"),
    (10, "traffic light"),
    (11, "fire hydrant"),
    (13, "stop sign"),
    (14, "parking meter"),
    (15, "bench"),
    (16, "bird"),
    (17, "cat"),
    (18, "dog"),
    (19, "horse"),
    (20, "sheep"),
    (21, "cow"),
    (22, "elephant"),
    (23, "bear"),
    (24, "zebra"),
    (25, "giraffe"),
    (27, "backpack"),
    (28, "umbrella"),
    (31, "handbag"),
    (32, "tie"),
    (33, "suitcase"),
    (34, "frisbee"),
    (35, "skis"),
    (36, "snowboard"),
    (37, "sports ball"),
    (38, "kite"),
    (39, "baseball bat"),
    (40, "baseball glove"),
    (41, "skateboard"),
    (42, "surfboard"),
    (43, "tennis racket"),
    (44, "bottle"),
    (46, "wine glass"),
    (47, "cup"),
    (48, "fork"),
    (49, "knife"),
    (50, "spoon"),
    (51, "bowl"),
    (52, "banana"),
    (53, "apple"),
    (54, "sandwich"),
    (55, "orange"),
    (56, "broccoli"),
    (57, "carrot"),
    (58, "hot dog"),
    (59, "pizza"),
    (60, "donut"),
    (61, "cake"),
    (62, "chair"),
    (63, "couch"),
    (64, "potted plant"),
    (65, "bed"),
    (67, "dining table"),
    (70, "toilet"),
    (72, "tv"),
    (73, "laptop"),
    (74, "mouse"),
    (75, "remote"),
    (76, "keyboard"),
    (77, "cell phone"),
    (78, "microwave"),
    (79, "oven"),
    (80, "toaster"),
    (81, "sink"),
    (82, "refrigerator"),
    (84, "book"),
    (85, "clock"),
    (86, "vase"),
    (87, "scissors"),
    (88, "teddy bear"),
    (89, "hair drier"),
    (90, "toothbrush"),
];

/// Maps a subset of COCO category ids to a compact, contiguous set of model ids.
///
/// Model id `0` is background, the selected categories follow from `1` in the order they were
/// given. Class logits and cross-entropy targets index this compact space directly.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassRemap {
    /// `(coco_id, name)` per model id, offset by one for background.
    categories: Vec<(usize, &'static str)>,
}

impl ClassRemap {
    /// Builds the remapping from COCO category names, e.g. `["person", "cat", "dog"]`.
    ///
    /// Surrounding whitespace is ignored. Fails on an empty list and on unknown names.
    pub fn new<S: AsRef<str>>(names: &[S]) -> Result<Self, ConfigError> {
        let categories = names
            .iter()
            .map(|name| {
                let name = name.as_ref().trim();
                COCO_CATEGORIES
                    .iter()
                    .find(|(_, label)| *label == name)
                    .copied()
                    .ok_or_else(|| ConfigError::UnknownCategory(name.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        if categories.is_empty() {
            return Err(ConfigError::InvalidClassCount(1));
        }

        Ok(Self { categories })
    }

    /// Parses a comma separated list such as `"dog,cat,person"`.
    pub fn parse(list: &str) -> Result<Self, ConfigError> {
        let names: Vec<&str> = list.split(',').filter(|s| !s.trim().is_empty()).collect();
        Self::new(&names)
    }

    /// Total number of model classes, background included.
    pub fn count(&self) -> usize {
        self.categories.len() + 1
    }

    /// COCO name of a model id, `"background"` for `0` and `None` when out of range.
    pub fn name(&self, model_id: usize) -> Option<&'static str> {
        match model_id {
            0 => Some("background"),
            id => self.categories.get(id - 1).map(|(_, name)| *name),
        }
    }

    /// The selected category names ordered by model id, background excluded.
    pub fn names(&self) -> Vec<&'static str> {
        self.categories.iter().map(|(_, name)| *name).collect()
    }

    /// Maps a COCO category id to its 1-based model id, `None` if it was not selected.
    pub fn coco_id_to_model_id(&self, coco_id: usize) -> Option<usize> {
        self.categories
            .iter()
            .position(|(id, _)| *id == coco_id)
            .map(|i| i + 1)
    }
}
