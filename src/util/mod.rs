use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quantiles {
    pub min: f32,
    pub pointzerofive: f32,
    pub pointtwofive: f32,
    pub pointfive: f32,
    pub pointsevenfive: f32,
    pub pointninefive: f32,
    pub max: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistributionProperties {
    pub quantiles: Quantiles,
    pub mean: f32,
    pub variance: f32,
    pub standard_deviation: f32,
    pub count: usize,
}

pub fn distribution_properties(data: &[f32]) -> Option<DistributionProperties> {
    if data.is_empty() {
        return None
    }

    let mut sorted = data.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let at = |q: f32| sorted[((sorted.len() as f32 * q) as usize).min(sorted.len() - 1)];

    let quantiles = Quantiles {
        min: sorted[0],
        pointzerofive: at(0.05),
        pointtwofive: at(0.25),
        pointfive: at(0.5),
        pointsevenfive: at(0.75),
        pointninefive: at(0.95),
        max: sorted[sorted.len() - 1]
    };

    let count = sorted.len();
    let mean = sorted.iter().sum::<f32>() / count as f32;
    let variance = sorted.iter().map(|e| (e - mean).powi(2)).sum::<f32>() / count as f32;

    Some(DistributionProperties {
        quantiles,
        mean,
        variance,
        standard_deviation: variance.sqrt(),
        count,
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bucket {
    pub left: f32,
    pub right: f32,
    pub count: usize,
}

/// Equal-width histogram over `[min, max]` plus the distribution summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Histogram {
    pub properties: DistributionProperties,
    pub buckets: Vec<Bucket>,
}

pub fn histogram(data: &[f32], num_buckets: usize) -> Option<Histogram> {
    let properties = distribution_properties(data)?;
    let min = properties.quantiles.min;
    let max = properties.quantiles.max;

    // a constant tensor collapses into a single bucket
    if max <= min || num_buckets <= 1 {
        return Some(Histogram {
            buckets: vec![Bucket { left: min, right: max, count: data.len() }],
            properties,
        });
    }

    let width = (max - min) / num_buckets as f32;
    let mut buckets = (0..num_buckets)
        .map(|i| Bucket {
            left: min + i as f32 * width,
            right: if i + 1 == num_buckets { max } else { min + (i + 1) as f32 * width },
            count: 0,
        })
        .collect::<Vec<_>>();

    for &value in data {
        let index = (((value - min) / width) as usize).min(num_buckets - 1);
        buckets[index].count += 1;
    }

    Some(Histogram { properties, buckets })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn properties_of_small_sample() {
        let props = distribution_properties(&[4.0, 1.0, 3.0, 2.0]).unwrap();

        assert_eq!(props.quantiles.min, 1.0);
        assert_eq!(props.quantiles.max, 4.0);
        assert_eq!(props.quantiles.pointfive, 3.0);
        assert_eq!(props.mean, 2.5);
        assert!((props.variance - 1.25).abs() < 1e-6);
        assert_eq!(props.count, 4);
        assert!(distribution_properties(&[]).is_none());
    }

    #[test]
    fn histogram_counts_every_value() {
        let data = (0..100).map(|i| i as f32 / 10.0).collect::<Vec<_>>();

        let histogram = histogram(&data, 30).unwrap();

        assert_eq!(histogram.buckets.len(), 30);
        assert_eq!(histogram.buckets.iter().map(|b| b.count).sum::<usize>(), 100);
        assert_eq!(histogram.buckets[0].left, 0.0);
        assert_eq!(histogram.buckets[29].right, 9.9);
        assert!(histogram.buckets[29].count > 0);
    }

    #[test]
    fn constant_data_uses_one_bucket() {
        let histogram = histogram(&[0.0; 64], 30).unwrap();

        assert_eq!(histogram.buckets, vec![Bucket { left: 0.0, right: 0.0, count: 64 }]);
    }
}
