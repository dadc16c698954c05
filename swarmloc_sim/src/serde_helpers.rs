// swarmloc_sim/src/serde_helpers.rs

pub mod vec3_f64_from_array {
    use nalgebra::Vector3;
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(vec: &Vector3<f64>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_seq([vec.x, vec.y, vec.z].iter())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vector3<f64>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let arr: [f64; 3] = Deserialize::deserialize(deserializer)?;
        Ok(Vector3::new(arr[0], arr[1], arr[2]))
    }
}

/// Yaw written in degrees in scenario files, kept in radians in memory.
pub mod yaw_rad_from_deg {
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(yaw: &f64, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_f64(yaw.to_degrees())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<f64, D::Error>
    where
        D: Deserializer<'de>,
    {
        let deg: f64 = Deserialize::deserialize(deserializer)?;
        Ok(deg.to_radians())
    }
}
