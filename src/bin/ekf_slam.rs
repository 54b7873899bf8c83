// EKF SLAM simulation on the generic Kalman filter engine
//
// A differential-drive robot circles through a field of point landmarks,
// observing them through a noisy range-bearing sensor. The filter runs
// with unknown correspondences: landmarks are associated by Mahalanobis
// gating and inserted on first sight.

use gnuplot::{AxesCommon, Caption, Color, Figure, PointSize, PointSymbol};
use nalgebra::{DMatrix, DVector, Vector2, Vector3};
use rand_distr::{Distribution, Normal};

use rust_kalman::{KFMethod, KFOptions, KalmanFilter, RangeBearingConfig, RangeBearingModel};

const DT: f64 = 0.1; // time step [s]
const SIM_TIME: f64 = 50.0; // simulation time [s]
const MAX_RANGE: f64 = 20.0; // maximum observation range [m]

fn normalize_angle(angle: f64) -> f64 {
    let mut a = angle;
    while a > std::f64::consts::PI {
        a -= 2.0 * std::f64::consts::PI;
    }
    while a < -std::f64::consts::PI {
        a += 2.0 * std::f64::consts::PI;
    }
    a
}

/// True robot motion, shared with the filter's transition model
fn motion_model(x: &Vector3<f64>, u: &Vector2<f64>) -> Vector3<f64> {
    Vector3::new(
        x[0] + u[0] * DT * x[2].cos(),
        x[1] + u[0] * DT * x[2].sin(),
        normalize_angle(x[2] + u[1] * DT),
    )
}

/// Simulate noisy range-bearing observations of the landmarks in range
fn get_observations(
    x_true: &Vector3<f64>,
    landmarks: &[(f64, f64)],
    r: &DMatrix<f64>,
) -> Vec<(f64, f64)> {
    let normal = Normal::new(0.0, 1.0).unwrap();
    let mut z = Vec::new();

    for (lx, ly) in landmarks.iter() {
        let dx = lx - x_true[0];
        let dy = ly - x_true[1];
        let d = (dx * dx + dy * dy).sqrt();

        if d <= MAX_RANGE {
            let angle = normalize_angle(dy.atan2(dx) - x_true[2]);
            let d_noisy = d + normal.sample(&mut rand::thread_rng()) * r[(0, 0)].sqrt();
            let angle_noisy = angle + normal.sample(&mut rand::thread_rng()) * r[(1, 1)].sqrt();
            z.push((d_noisy, angle_noisy));
        }
    }
    z
}

fn main() {
    tracing_subscriber::fmt::init();

    println!("EKF SLAM start!");

    // Landmark positions [x, y]
    let landmarks: Vec<(f64, f64)> = vec![
        (10.0, -2.0),
        (15.0, 10.0),
        (3.0, 15.0),
        (-5.0, 20.0),
        (-5.0, 5.0),
    ];

    let config = RangeBearingConfig::default();
    let r_sensor = config.r.clone();

    let model = RangeBearingModel::new(config);
    let options = KFOptions {
        method: KFMethod::NaiveEkf,
        ..Default::default()
    };
    let mut filter = KalmanFilter::new(model, options).unwrap();

    // True state and dead reckoning: [x, y, yaw]
    let mut x_true = Vector3::new(0.0, 0.0, 0.0);
    let mut x_dr = Vector3::new(0.0, 0.0, 0.0);

    // Control input: [v, yaw_rate]
    let u = Vector2::new(1.0, 0.1);

    // History for plotting
    let mut h_true: Vec<(f64, f64)> = vec![(0.0, 0.0)];
    let mut h_dr: Vec<(f64, f64)> = vec![(0.0, 0.0)];
    let mut h_est: Vec<(f64, f64)> = vec![(0.0, 0.0)];

    let normal = Normal::new(0.0, 1.0).unwrap();
    let q = DMatrix::from_diagonal(&DVector::from_vec(vec![
        0.2,
        (5.0_f64).to_radians().powi(2),
    ]));

    let mut time = 0.0;
    while time <= SIM_TIME {
        time += DT;

        x_true = motion_model(&x_true, &u);

        // Dead reckoning with noisy control
        let u_noisy = Vector2::new(
            u[0] + normal.sample(&mut rand::thread_rng()) * q[(0, 0)].sqrt(),
            u[1] + normal.sample(&mut rand::thread_rng()) * q[(1, 1)].sqrt(),
        );
        x_dr = motion_model(&x_dr, &u_noisy);

        // Feed the filter and run one cycle
        filter.model_mut().set_control(u_noisy[0], u_noisy[1]);
        for (d, angle) in get_observations(&x_true, &landmarks, &r_sensor) {
            filter.model_mut().push_observation(d, angle);
        }
        if let Err(err) = filter.run_one_iteration() {
            eprintln!("filter failed at t={:.1}: {}", time, err);
            return;
        }

        h_true.push((x_true[0], x_true[1]));
        h_dr.push((x_dr[0], x_dr[1]));
        h_est.push((filter.state().x[0], filter.state().x[1]));
    }

    println!("Done!");
    println!(
        "Number of landmarks detected: {}",
        filter.state().num_landmarks()
    );

    println!("\nLandmark estimates vs true positions:");
    for (i, (true_x, true_y)) in landmarks.iter().enumerate() {
        if i < filter.state().num_landmarks() {
            let lm = filter.state().landmark(i);
            let err = ((lm[0] - true_x).powi(2) + (lm[1] - true_y).powi(2)).sqrt();
            println!(
                "  LM{}: True=({:.2}, {:.2}), Est=({:.2}, {:.2}), Error={:.3}m",
                i, true_x, true_y, lm[0], lm[1], err
            );
        }
    }

    // Save final plot
    let mut fig = Figure::new();

    let true_x: Vec<f64> = h_true.iter().map(|p| p.0).collect();
    let true_y: Vec<f64> = h_true.iter().map(|p| p.1).collect();
    let dr_x: Vec<f64> = h_dr.iter().map(|p| p.0).collect();
    let dr_y: Vec<f64> = h_dr.iter().map(|p| p.1).collect();
    let est_x: Vec<f64> = h_est.iter().map(|p| p.0).collect();
    let est_y: Vec<f64> = h_est.iter().map(|p| p.1).collect();
    let lm_x: Vec<f64> = landmarks.iter().map(|p| p.0).collect();
    let lm_y: Vec<f64> = landmarks.iter().map(|p| p.1).collect();

    let mut est_lm_x: Vec<f64> = Vec::new();
    let mut est_lm_y: Vec<f64> = Vec::new();
    for i in 0..filter.state().num_landmarks() {
        let lm = filter.state().landmark(i);
        est_lm_x.push(lm[0]);
        est_lm_y.push(lm[1]);
    }

    fig.axes2d()
        .set_title("EKF SLAM", &[])
        .set_x_label("x [m]", &[])
        .set_y_label("y [m]", &[])
        .points(
            &lm_x,
            &lm_y,
            &[
                Caption("True Landmarks"),
                Color("black"),
                PointSymbol('*'),
                PointSize(2.0),
            ],
        )
        .points(
            &est_lm_x,
            &est_lm_y,
            &[
                Caption("Est. Landmarks"),
                Color("cyan"),
                PointSymbol('O'),
                PointSize(1.5),
            ],
        )
        .lines(&true_x, &true_y, &[Caption("True"), Color("blue")])
        .lines(&dr_x, &dr_y, &[Caption("Dead Reckoning"), Color("yellow")])
        .lines(&est_x, &est_y, &[Caption("EKF SLAM"), Color("green")]);

    match fig.save_to_svg("./img/ekf_slam.svg", 640, 480) {
        Ok(_) => println!("Plot saved to ./img/ekf_slam.svg"),
        Err(e) => eprintln!("Failed to save SVG: {:?}", e),
    }
}
